//! Resolved run configuration and validation.
//!
//! Precedence is CLI flag, then environment variable, then `.acprun.toml`,
//! then built-in defaults. clap already folds `ACPRUN_AGENT` and
//! `ACPRUN_MODELS` into the parsed arguments.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use crate::acp::codec::Framing;
use crate::acp::session::{AuthConfig, AuthMode};
use crate::cli::Args;
use crate::project::ProjectConfig;

const DEFAULT_MODEL: &str = "default";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing `.acprun.toml`, or where discovery started.
    pub project_root: PathBuf,
    /// Working directory of the agent and of the session.
    pub cwd: PathBuf,
    pub agent_command: String,
    pub framing: Framing,
    pub model_env: Option<String>,
    pub model_arg: Option<String>,
    /// Extra agent environment, including an injected credential.
    pub agent_env: Vec<(String, String)>,
    /// Model candidates in fallback order; never empty.
    pub models: Vec<String>,
    pub auth: AuthConfig,
    pub auto_approve: bool,
    pub read_only: bool,
    pub allowed_write_paths: Vec<PathBuf>,
    pub session_file: PathBuf,
    pub prompt: Option<String>,
    pub interactive: bool,
    pub verbose: bool,
    pub log_file: bool,
}

impl Config {
    /// Build config from CLI args and the discovered project file.
    pub fn from_args(args: &Args, project: ProjectConfig) -> Result<Self> {
        let invocation_dir = env::current_dir()?;
        Self::resolve(args, project, &invocation_dir, |key| env::var(key).ok())
    }

    fn resolve(
        args: &Args,
        project: ProjectConfig,
        invocation_dir: &Path,
        lookup_env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = project.config;
        let prompt = args.prompt_text();

        if args.interactive && prompt.is_some() {
            bail!("a prompt argument and --interactive are mutually exclusive");
        }
        if !args.interactive && prompt.is_none() {
            bail!("nothing to do: pass a prompt or --interactive");
        }

        let agent_command = match args.agent.clone().or(file.agent.command) {
            Some(command) if !command.trim().is_empty() => command,
            _ => bail!(
                "No agent command configured. Pass --agent, set ACPRUN_AGENT, \
                 or set [agent] command in .acprun.toml"
            ),
        };

        let models = if !args.models.is_empty() {
            args.models.clone()
        } else if !file.models.candidates.is_empty() {
            file.models.candidates
        } else {
            vec![DEFAULT_MODEL.to_string()]
        };
        validate_models(&models)?;

        let mut agent_env: Vec<(String, String)> = file.agent.env.into_iter().collect();

        let credential = match &file.auth.credential_env {
            Some(var) => match lookup_env(var) {
                Some(value) if !value.is_empty() => Some(value),
                _ => bail!("credential variable {var} is not set"),
            },
            None => None,
        };
        if let Some(inject_as) = &file.auth.inject_as {
            match &credential {
                Some(value) => agent_env.push((inject_as.clone(), value.clone())),
                None => bail!("[auth] inject_as needs credential_env to be set"),
            }
        }
        if file.auth.mode == AuthMode::Session && credential.is_none() {
            bail!("[auth] mode = \"session\" needs credential_env to be set");
        }

        let cwd = match (&args.cwd, &file.session.cwd) {
            (Some(dir), _) => invocation_dir.join(dir),
            (None, Some(dir)) => project.root.join(dir),
            (None, None) => project.root.clone(),
        };
        if !cwd.is_dir() {
            bail!("working directory {} does not exist", cwd.display());
        }

        let model_env = Some(file.agent.model_env).filter(|v| !v.is_empty());
        let allowed_write_paths = file
            .tools
            .allowed_write_paths
            .iter()
            .map(|p| project.root.join(p))
            .collect();

        Ok(Self {
            project_root: project.root,
            cwd,
            agent_command,
            framing: args.framing.or(file.agent.framing).unwrap_or_default(),
            model_env,
            model_arg: file.agent.model_arg,
            agent_env,
            models,
            auth: AuthConfig {
                mode: file.auth.mode,
                method_id: file.auth.method_id,
                credential,
            },
            auto_approve: args.yes || file.tools.auto_approve,
            read_only: args.read_only || file.tools.read_only,
            allowed_write_paths,
            session_file: file.session.file,
            prompt,
            interactive: args.interactive,
            verbose: args.verbose,
            log_file: args.log_file,
        })
    }
}

fn validate_models(models: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for model in models {
        if model.trim().is_empty() {
            bail!("model candidate names must not be empty");
        }
        if !seen.insert(model.as_str()) {
            bail!("model candidate '{}' is listed twice", model);
        }
    }
    Ok(())
}
