//! Tool execution: consent, capability dispatch and result shaping.
//!
//! `ToolExecutor` is the client side of every agent-initiated side effect.
//! It never touches the filesystem or spawns a process itself; it resolves a
//! tool name to a `ToolKind`, asks the `ConsentSource`, and only then calls
//! into `Capabilities`. `LocalCapabilities` is the real backend.
//!
//! Everything here is `?Send`: the executor lives on the `LocalSet` thread
//! alongside the session it serves.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use colored::Colorize;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::acp::error::{AcpError, Result};
use crate::acp::streaming::summarize_tool_input;
use crate::acp::types::{PermissionOption, RequestPermissionParams};

/// Maximum bytes of shell output kept (1 MB); older output is dropped.
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

// ---- Tool model ----

/// The fixed set of tools the client provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Shell,
    ReadFile,
    WriteFile,
}

impl ToolKind {
    /// Resolve a wire tool name, including the aliases agents use.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "terminal/execute" | "terminal/exec" | "shell" | "bash" | "run_shell_command"
            | "execute_command" => Some(ToolKind::Shell),
            "fs/read_text_file" | "fs.read" | "read_file" => Some(ToolKind::ReadFile),
            "fs/write_text_file" | "fs.write" | "write_file" => Some(ToolKind::WriteFile),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Requested,
    Consented,
    Rejected,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolStatus::Requested => "requested",
            ToolStatus::Consented => "consented",
            ToolStatus::Rejected => "rejected",
            ToolStatus::Running => "running",
            ToolStatus::Completed => "completed",
            ToolStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Output of a completed capability.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Shell(ShellOutput),
    Read(String),
    Written,
}

impl ToolOutput {
    /// Text form relayed inside a `tool_result` block.
    pub fn to_text(&self) -> String {
        match self {
            ToolOutput::Shell(out) if out.exit_code == 0 => out.stdout.clone(),
            ToolOutput::Shell(out) => format!("{}\n[exit code {}]", out.stdout, out.exit_code),
            ToolOutput::Read(content) => content.clone(),
            ToolOutput::Written => "ok".to_string(),
        }
    }

    /// Result object for a direct client-method call.
    pub fn to_value(&self) -> Value {
        match self {
            ToolOutput::Shell(out) => json!({"stdout": out.stdout, "exitCode": out.exit_code}),
            ToolOutput::Read(content) => json!({ "content": content }),
            ToolOutput::Written => json!({}),
        }
    }
}

/// One agent-initiated tool invocation and where it ended up.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub status: ToolStatus,
    pub output: Option<ToolOutput>,
    pub error: Option<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            status: ToolStatus::Requested,
            output: None,
            error: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status != ToolStatus::Completed
    }

    pub fn result_text(&self) -> String {
        match (self.status, &self.output, &self.error) {
            (ToolStatus::Completed, Some(output), _) => output.to_text(),
            (ToolStatus::Rejected, _, _) => "tool call rejected by user".to_string(),
            (_, _, Some(error)) => error.clone(),
            _ => format!("tool call {}", self.status),
        }
    }

    fn fail(&mut self, error: &AcpError) {
        self.status = ToolStatus::Failed;
        self.error = Some(error.to_string());
    }
}

// ---- Collaborators ----

/// Decides whether a tool call may run.
#[async_trait(?Send)]
pub trait ConsentSource {
    async fn ask(&self, tool_name: &str, input: &Value) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShellOutput {
    /// Combined stdout then stderr.
    pub stdout: String,
    /// `-1` when the process died from a signal.
    pub exit_code: i32,
}

/// Side-effecting backends invoked after consent.
#[async_trait(?Send)]
pub trait Capabilities {
    async fn run_shell(&self, command: &str) -> Result<ShellOutput>;
    /// `Ok(None)` when the file does not exist.
    async fn read_file(&self, path: &Path) -> Result<Option<String>>;
    async fn write_file(&self, path: &Path, content: &str) -> Result<()>;
}

/// Approves everything (`--yes`).
pub struct AutoApprove;

#[async_trait(?Send)]
impl ConsentSource for AutoApprove {
    async fn ask(&self, _tool_name: &str, _input: &Value) -> bool {
        true
    }
}

/// Refuses everything.
pub struct DenyAll;

#[async_trait(?Send)]
impl ConsentSource for DenyAll {
    async fn ask(&self, _tool_name: &str, _input: &Value) -> bool {
        false
    }
}

/// Asks on the terminal. Without a TTY on stdin, nothing is approved.
pub struct TerminalPrompt;

#[async_trait(?Send)]
impl ConsentSource for TerminalPrompt {
    async fn ask(&self, tool_name: &str, input: &Value) -> bool {
        if !io::stdin().is_terminal() {
            tracing::debug!(tool = tool_name, "stdin is not a terminal; denying tool call");
            return false;
        }

        let summary = summarize_tool_input(input);
        eprint!(
            "\n{} {} {}\n{} ",
            "?".yellow().bold(),
            tool_name.blue().bold(),
            summary.dimmed(),
            "Allow this tool call? [y/N]".yellow()
        );
        let _ = io::stderr().flush();

        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;

        matches!(answer, Ok(Ok(line)) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

/// Real filesystem and shell backend rooted at the project directory.
pub struct LocalCapabilities {
    project_root: PathBuf,
    /// If `true`, file writes are rejected.
    read_only: bool,
    /// If set, only these paths may be written.
    allowed_write_paths: Option<Vec<PathBuf>>,
}

impl LocalCapabilities {
    pub fn new(project_root: PathBuf, read_only: bool) -> Self {
        Self {
            project_root,
            read_only,
            allowed_write_paths: None,
        }
    }

    /// Restrict file writes to only the specified paths.
    pub fn with_allowed_write_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.allowed_write_paths = Some(paths);
        self
    }
}

/// Canonical form of a path that may not exist yet: the deepest existing
/// ancestor is resolved and the rest appended.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => canonicalize_lenient(parent).join(name),
        _ => path.to_path_buf(),
    }
}

#[async_trait(?Send)]
impl Capabilities for LocalCapabilities {
    async fn run_shell(&self, command: &str) -> Result<ShellOutput> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AcpError::ToolExecution(format!("failed to run '{command}': {e}")))?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        if combined.len() > MAX_OUTPUT_SIZE {
            let excess = combined.len() - MAX_OUTPUT_SIZE;
            combined.drain(..excess);
        }

        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&combined).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AcpError::ToolExecution(format!(
                "failed to read file {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        if self.read_only {
            return Err(AcpError::ToolExecution(
                "file writes are not allowed in read-only mode".to_string(),
            ));
        }

        if let Some(ref allowed) = self.allowed_write_paths {
            let target = canonicalize_lenient(path);
            // An allowed directory covers everything beneath it.
            let is_allowed = allowed.iter().any(|p| {
                let p = if p.is_relative() {
                    self.project_root.join(p)
                } else {
                    p.clone()
                };
                target.starts_with(canonicalize_lenient(&p))
            });
            if !is_allowed {
                return Err(AcpError::ToolExecution(format!(
                    "write not allowed: only {} may be written",
                    allowed
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AcpError::ToolExecution(format!(
                    "failed to create parent directories for {}: {e}",
                    path.display()
                ))
            })?;
        }

        tokio::fs::write(path, content).await.map_err(|e| {
            AcpError::ToolExecution(format!("failed to write file {}: {e}", path.display()))
        })
    }
}

// ---- Executor ----

#[derive(Deserialize)]
struct ShellInput {
    #[serde(alias = "cmd")]
    command: String,
}

#[derive(Deserialize)]
struct ReadInput {
    #[serde(alias = "file_path")]
    path: PathBuf,
    #[serde(default)]
    line: Option<u32>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct WriteInput {
    #[serde(alias = "file_path")]
    path: PathBuf,
    content: String,
}

enum Invocation {
    Shell(ShellInput),
    Read(ReadInput),
    Write(WriteInput),
}

pub struct ToolExecutor {
    consent: Box<dyn ConsentSource>,
    capabilities: Box<dyn Capabilities>,
    /// Relative tool paths resolve against this.
    project_root: PathBuf,
    read_only: bool,
    /// Paths written since the last `take_files_modified`, project-relative.
    files_modified: RefCell<Vec<String>>,
}

impl ToolExecutor {
    pub fn new(
        consent: Box<dyn ConsentSource>,
        capabilities: Box<dyn Capabilities>,
        project_root: PathBuf,
    ) -> Self {
        Self {
            consent,
            capabilities,
            project_root,
            read_only: false,
            files_modified: RefCell::new(Vec::new()),
        }
    }

    /// Refuse write-kind permission requests without asking.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn take_files_modified(&self) -> Vec<String> {
        std::mem::take(&mut *self.files_modified.borrow_mut())
    }

    /// Run one tool call through consent and the matching capability.
    ///
    /// Never returns an error: failures and rejections are recorded on the
    /// returned `ToolCall` so they can be reported to the agent.
    pub async fn execute(&self, mut call: ToolCall) -> ToolCall {
        let invocation = match self.parse(&call.name, &call.input) {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "rejecting tool call");
                call.fail(&e);
                return call;
            }
        };

        if !self.consent.ask(&call.name, &call.input).await {
            tracing::debug!(tool = %call.name, id = %call.id, "tool call rejected");
            call.status = ToolStatus::Rejected;
            return call;
        }
        tracing::trace!(tool = %call.name, id = %call.id, "tool call consented");

        call.status = ToolStatus::Running;
        match self.invoke(invocation).await {
            Ok(output) => {
                call.status = ToolStatus::Completed;
                call.output = Some(output);
            }
            Err(e) => {
                tracing::debug!(tool = %call.name, error = %e, "tool call failed");
                call.fail(&e);
            }
        }
        call
    }

    fn parse(&self, name: &str, input: &Value) -> Result<Invocation> {
        let kind = ToolKind::from_name(name)
            .ok_or_else(|| AcpError::ToolExecution(format!("unknown tool '{name}'")))?;
        let invalid =
            |e: serde_json::Error| AcpError::ToolExecution(format!("invalid input for '{name}': {e}"));
        Ok(match kind {
            ToolKind::Shell => Invocation::Shell(serde_json::from_value(input.clone()).map_err(invalid)?),
            ToolKind::ReadFile => Invocation::Read(serde_json::from_value(input.clone()).map_err(invalid)?),
            ToolKind::WriteFile => {
                Invocation::Write(serde_json::from_value(input.clone()).map_err(invalid)?)
            }
        })
    }

    async fn invoke(&self, invocation: Invocation) -> Result<ToolOutput> {
        match invocation {
            Invocation::Shell(input) => {
                let output = self.capabilities.run_shell(&input.command).await?;
                Ok(ToolOutput::Shell(output))
            }
            Invocation::Read(input) => {
                let path = self.resolve(&input.path);
                let content = self.capabilities.read_file(&path).await?.ok_or_else(|| {
                    AcpError::ToolExecution(format!("file not found: {}", path.display()))
                })?;
                Ok(ToolOutput::Read(slice_lines(content, input.line, input.limit)))
            }
            Invocation::Write(input) => {
                let path = self.resolve(&input.path);
                self.capabilities.write_file(&path, &input.content).await?;
                let normalized = self.normalize_path(&path);
                self.files_modified.borrow_mut().push(normalized);
                Ok(ToolOutput::Written)
            }
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    /// Project-relative when under the root, absolute otherwise.
    fn normalize_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.project_root) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    /// Answer `session/request_permission` with a chosen option.
    pub async fn request_permission(&self, params: &RequestPermissionParams) -> Value {
        let tool = &params.tool_call;
        let is_write = matches!(tool.kind.as_deref(), Some("edit" | "delete" | "move"));
        let label = tool
            .title
            .as_deref()
            .or(tool.kind.as_deref())
            .unwrap_or("tool call");

        let allowed = if self.read_only && is_write {
            false
        } else {
            self.consent.ask(label, &tool.raw_input).await
        };

        let choice = if allowed {
            pick_option(&params.options, &["allow_once", "allow_always"])
        } else {
            pick_option(&params.options, &["reject_once", "reject_always"])
        };

        match choice {
            Some(option) => json!({"outcome": {"outcome": "selected", "optionId": option.option_id}}),
            None => {
                if allowed {
                    tracing::warn!(tool = label, "no allow option offered; cancelling");
                }
                json!({"outcome": {"outcome": "cancelled"}})
            }
        }
    }
}

/// First option of the earliest matching kind.
fn pick_option<'a>(options: &'a [PermissionOption], kinds: &[&str]) -> Option<&'a PermissionOption> {
    kinds
        .iter()
        .find_map(|kind| options.iter().find(|opt| opt.kind == *kind))
}

/// Apply a 1-based line offset and a line limit.
fn slice_lines(content: String, line: Option<u32>, limit: Option<u32>) -> String {
    if line.is_none() && limit.is_none() {
        return content;
    }
    let offset = line.map(|l| l.saturating_sub(1) as usize).unwrap_or(0);
    let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
    content
        .lines()
        .skip(offset)
        .take(limit)
        .collect::<Vec<_>>()
        .join("\n")
}

// ---- Unit tests ----
