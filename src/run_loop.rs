//! Top-level run: one-shot prompt or interactive prompt loop.
//!
//! Everything here runs inside a `LocalSet` on a current-thread runtime,
//! since the engine's futures are `!Send`.

use std::rc::Rc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::acp::engine::Engine;
use crate::acp::error::AcpError;
use crate::acp::session::SessionOptions;
use crate::acp::tools::{AutoApprove, ConsentSource, LocalCapabilities, TerminalPrompt, ToolExecutor};
use crate::acp::transport::{ProcessConnector, ProcessSpec};
use crate::config::Config;
use crate::interrupt;
use crate::output::formatter;
use crate::session_store;

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every prompt completed.
    Complete,
    /// Ctrl+C; the current turn was cancelled and the agent shut down.
    Interrupted,
    /// A fatal error. Carries the process exit status to use.
    Failed(i32),
}

/// Run the configured prompt(s) to completion.
pub async fn run(config: Config) -> Result<Outcome> {
    interrupt::register_signal_handler().context("Failed to register signal handler")?;

    show_previous_session(&config);

    let connector = build_connector(&config)?;
    let tools = Rc::new(build_tools(&config));
    let mut options = SessionOptions::new(&config.cwd);
    options.auth = config.auth.clone();
    options.session_file = Some(config.session_file.clone());
    options.read_only = config.read_only;

    let mut engine = Engine::new(Box::new(connector), config.models.clone(), tools, options);

    let outcome = drive(&mut engine, &config).await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            formatter::print_fatal(&e.to_string());
            Outcome::Failed(failure_status(&engine))
        }
    };
    engine.shutdown().await;
    Ok(outcome)
}

async fn drive(engine: &mut Engine, config: &Config) -> Result<Outcome, AcpError> {
    let session_id = tokio::select! {
        started = engine.start() => started?,
        _ = interrupt::wait_for_interrupt() => return Ok(Outcome::Interrupted),
    };
    tracing::info!(session_id = %session_id, "session established");
    formatter::print_info(&format!(
        "session {} ({})",
        session_id,
        engine.model().unwrap_or("?")
    ));

    match &config.prompt {
        Some(prompt) if !config.interactive => one_shot(engine, prompt).await,
        _ => interactive(engine).await,
    }
}

async fn one_shot(engine: &mut Engine, prompt: &str) -> Result<Outcome, AcpError> {
    let outcome = engine
        .prompt_until(prompt, interrupt::wait_for_interrupt())
        .await?;
    formatter::print_turn_summary(&outcome);
    if interrupt::is_interrupted() {
        return Ok(Outcome::Interrupted);
    }
    Ok(Outcome::Complete)
}

/// Read prompts from stdin until `exit`, `quit`, EOF or Ctrl+C.
async fn interactive(engine: &mut Engine) -> Result<Outcome, AcpError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        crate::acp::streaming::flush_stdout();

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = interrupt::wait_for_interrupt() => return Ok(Outcome::Interrupted),
        };
        let Some(line) = line else {
            return Ok(Outcome::Complete);
        };
        let prompt = line.trim();
        match prompt {
            "" => continue,
            "exit" | "quit" => return Ok(Outcome::Complete),
            _ => {}
        }

        match engine
            .prompt_until(prompt, interrupt::wait_for_interrupt())
            .await
        {
            Ok(outcome) => formatter::print_turn_summary(&outcome),
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => formatter::print_warning(&format!("turn failed: {e}")),
        }
        if interrupt::is_interrupted() {
            return Ok(Outcome::Interrupted);
        }
        formatter::print_separator();
    }
}

/// Errors after which the session cannot take another prompt.
fn is_fatal(e: &AcpError) -> bool {
    matches!(
        e,
        AcpError::Transport(_) | AcpError::Auth(_) | AcpError::QuotaExhausted { .. } | AcpError::Io(_)
    )
}

/// Exit status for a fatal error: the agent's own status if it exited non-zero.
fn failure_status(engine: &Engine) -> i32 {
    engine
        .last_exit()
        .and_then(|exit| exit.code)
        .filter(|code| *code != 0)
        .unwrap_or(1)
}

fn build_connector(config: &Config) -> Result<ProcessConnector> {
    let mut spec = ProcessSpec::parse(&config.agent_command, &config.cwd)?;
    for (key, value) in &config.agent_env {
        spec = spec.env(key, value);
    }
    Ok(ProcessConnector {
        spec,
        framing: config.framing,
        model_env: config.model_env.clone(),
        model_arg: config.model_arg.clone(),
    })
}

fn build_tools(config: &Config) -> ToolExecutor {
    let consent: Box<dyn ConsentSource> = if config.auto_approve {
        Box::new(AutoApprove)
    } else {
        Box::new(TerminalPrompt)
    };
    let mut capabilities = LocalCapabilities::new(config.cwd.clone(), config.read_only);
    if !config.allowed_write_paths.is_empty() {
        capabilities = capabilities.with_allowed_write_paths(config.allowed_write_paths.clone());
    }
    ToolExecutor::new(consent, Box::new(capabilities), config.cwd.clone())
        .with_read_only(config.read_only)
}

fn show_previous_session(config: &Config) {
    let path = config.cwd.join(&config.session_file);
    match session_store::load(&path) {
        Ok(Some(previous)) => formatter::print_session_resume(&previous),
        Ok(None) => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring session file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::codec::Framing;
    use crate::acp::session::AuthConfig;
    use std::path::PathBuf;

    fn config() -> Config {
        Config {
            project_root: PathBuf::from("/work"),
            cwd: PathBuf::from("/work"),
            agent_command: "agent --acp 'two words'".to_string(),
            framing: Framing::ContentLength,
            model_env: Some("ACP_MODEL".to_string()),
            model_arg: Some("--model".to_string()),
            agent_env: vec![("ANTHROPIC_API_KEY".to_string(), "sk".to_string())],
            models: vec!["a".to_string()],
            auth: AuthConfig::default(),
            auto_approve: false,
            read_only: false,
            allowed_write_paths: Vec::new(),
            session_file: PathBuf::from(".acp-session.json"),
            prompt: Some("hi".to_string()),
            interactive: false,
            verbose: false,
            log_file: false,
        }
    }

    #[test]
    fn connector_carries_command_env_and_model() {
        let connector = build_connector(&config()).unwrap();
        let spec = connector.spec_for("model-b");
        assert_eq!(spec.program, "agent");
        assert_eq!(spec.args, vec!["--acp", "two words", "--model", "model-b"]);
        assert!(spec
            .env
            .contains(&("ANTHROPIC_API_KEY".to_string(), "sk".to_string())));
        assert!(spec.env.contains(&("ACP_MODEL".to_string(), "model-b".to_string())));
        assert_eq!(spec.cwd, PathBuf::from("/work"));
        assert_eq!(connector.framing, Framing::ContentLength);
    }

    #[test]
    fn invalid_agent_command_is_an_error() {
        let mut config = config();
        config.agent_command = "agent 'unterminated".to_string();
        assert!(build_connector(&config).is_err());
    }

    #[test]
    fn fatal_errors() {
        assert!(is_fatal(&AcpError::Transport("gone".into())));
        assert!(is_fatal(&AcpError::Auth("bad key".into())));
        assert!(!is_fatal(&AcpError::ToolExecution("x".into())));
        assert!(!is_fatal(&AcpError::Quota("x".into())));
    }
}
