//! Project configuration discovery and loading.
//!
//! A project may carry an `.acprun.toml` at its root. This module walks up
//! the directory tree to find it and parses it. The file is optional: when
//! none is found, the starting directory is the root and defaults apply.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::acp::codec::Framing;
use crate::acp::session::AuthMode;

pub const CONFIG_FILE: &str = ".acprun.toml";

/// Project configuration loaded from `.acprun.toml`.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    /// The directory containing `.acprun.toml`, or the starting directory.
    pub root: PathBuf,
    /// The file that was loaded, if any.
    pub path: Option<PathBuf>,
    pub config: AcprunConfig,
}

/// Contents of `.acprun.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AcprunConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// Command line of the agent, shell-split.
    pub command: Option<String>,
    pub framing: Option<Framing>,
    /// Environment variable carrying the model name to the agent.
    #[serde(default = "default_model_env")]
    pub model_env: String,
    /// Flag appended with the model name, e.g. `--model`.
    pub model_arg: Option<String>,
    /// Extra environment for the agent process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            framing: None,
            model_env: default_model_env(),
            model_arg: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelsSection {
    #[serde(default)]
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthSection {
    #[serde(default)]
    pub mode: AuthMode,
    pub method_id: Option<String>,
    /// Variable acprun reads the credential from.
    pub credential_env: Option<String>,
    /// Variable the credential is passed to the agent under.
    pub inject_as: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolsSection {
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub allowed_write_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_file")]
    pub file: PathBuf,
    pub cwd: Option<PathBuf>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            file: default_session_file(),
            cwd: None,
        }
    }
}

fn default_model_env() -> String {
    "ACP_MODEL".to_string()
}

fn default_session_file() -> PathBuf {
    PathBuf::from(".acp-session.json")
}

/// Discover the project configuration by walking up from CWD.
pub fn discover() -> Result<ProjectConfig> {
    let cwd = env::current_dir()?;
    discover_from(&cwd)
}

/// Discover the project configuration starting from a specific directory.
pub fn discover_from(start: &Path) -> Result<ProjectConfig> {
    let mut current = start;

    loop {
        let config_path = current.join(CONFIG_FILE);
        if config_path.is_file() {
            let config = load_config(&config_path)?;
            return Ok(ProjectConfig {
                root: current.to_path_buf(),
                path: Some(config_path),
                config,
            });
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => {
                return Ok(ProjectConfig {
                    root: start.to_path_buf(),
                    path: None,
                    config: AcprunConfig::default(),
                })
            }
        }
    }
}

/// Load and parse an `.acprun.toml` file.
fn load_config(path: &Path) -> Result<AcprunConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: AcprunConfig =
        toml::from_str(&content).with_context(|| format!("Invalid {}", path.display()))?;
    Ok(config)
}

const DEFAULT_CONFIG: &str = r#"[agent]
# command = "claude-code-acp"
# framing = "newline"          # or "content-length"
# model_env = "ACP_MODEL"
# model_arg = "--model"
# [agent.env]
# NODE_OPTIONS = "--max-old-space-size=4096"

[models]
# Tried in order; the next one takes over when a model runs out of quota.
# candidates = ["primary-model", "backup-model"]

[auth]
# mode = "none"                # "authenticate" or "session"
# method_id = "api-key"
# credential_env = "CLAUDE_API_KEY"
# inject_as = "ANTHROPIC_API_KEY"

[tools]
# auto_approve = false
# read_only = false
# allowed_write_paths = ["src", "tests"]

[session]
# file = ".acp-session.json"
"#;

/// Write a commented `.acprun.toml` into the current directory.
pub fn init() -> Result<()> {
    let cwd = env::current_dir()?;
    init_in_dir(&cwd)
}

fn init_in_dir(cwd: &Path) -> Result<()> {
    let config_path = cwd.join(CONFIG_FILE);
    if config_path.exists() {
        println!("{CONFIG_FILE} already exists, skipping.");
        return Ok(());
    }

    fs::write(&config_path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to create {CONFIG_FILE}"))?;
    println!("Created {CONFIG_FILE}");
    println!("Next steps:");
    println!("  - Set [agent] command to your ACP agent");
    println!("  - List fallback models under [models] candidates");
    Ok(())
}
