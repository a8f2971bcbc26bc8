//! Supervisor: one live session plus model fallback.
//!
//! `Engine` owns the candidate list for the whole run. Whenever a session
//! fails with a quota-class error, in any phase, the session is shut down
//! (failing its pending calls), the next candidate is selected and a fresh
//! session is established from the handshake on a new transport. A prompt
//! that hit the quota is re-sent to the new session.

use std::future::Future;
use std::rc::Rc;

use futures::FutureExt;

use crate::acp::error::{AcpError, Result};
use crate::acp::fallback::{ModelFallbackManager, Transition};
use crate::acp::session::{SessionController, SessionOptions, SessionState};
use crate::acp::tools::ToolExecutor;
use crate::acp::transport::{Connector, ExitInfo};
use crate::acp::types::TurnOutcome;
use crate::output::formatter;

pub struct Engine {
    connector: Box<dyn Connector>,
    fallback: ModelFallbackManager,
    tools: Rc<ToolExecutor>,
    options: SessionOptions,
    controller: Option<SessionController>,
}

impl Engine {
    pub fn new(
        connector: Box<dyn Connector>,
        models: Vec<String>,
        tools: Rc<ToolExecutor>,
        options: SessionOptions,
    ) -> Self {
        Self {
            connector,
            fallback: ModelFallbackManager::new(models),
            tools,
            options,
            controller: None,
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.fallback.current()
    }

    pub fn session(&self) -> Option<&SessionState> {
        self.controller.as_ref().map(SessionController::state)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.controller.as_ref().and_then(SessionController::session_id)
    }

    pub fn transitions(&self) -> &[Transition] {
        self.fallback.transitions()
    }

    /// Exit status of the current agent, if it has exited.
    pub fn last_exit(&self) -> Option<&ExitInfo> {
        self.controller.as_ref().and_then(SessionController::exit_info)
    }

    /// Establish a session, falling back through candidates on quota errors.
    pub async fn start(&mut self) -> Result<String> {
        loop {
            let model = self
                .fallback
                .current()
                .ok_or_else(|| AcpError::QuotaExhausted {
                    tried: self.fallback.models().tried().join(", "),
                    last_error: "no model candidates left".to_string(),
                })?
                .to_string();

            match self.connect(&model).await {
                Ok(session_id) => return Ok(session_id),
                Err(e) if e.is_quota() => self.fall_back(e).await?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one prompt, retrying on the next model after a quota failure.
    pub async fn prompt(&mut self, text: &str) -> Result<TurnOutcome> {
        self.prompt_until(text, std::future::pending()).await
    }

    /// Like `prompt`, cancelling the turn once `cancel` resolves.
    pub async fn prompt_until<C>(&mut self, text: &str, cancel: C) -> Result<TurnOutcome>
    where
        C: Future<Output = ()>,
    {
        // Fused so a retry after fallback doesn't poll a finished future.
        let cancel = cancel.fuse();
        tokio::pin!(cancel);

        loop {
            if self.controller.is_none() {
                self.start().await?;
            }
            let Some(controller) = self.controller.as_mut() else {
                return Err(AcpError::Transport("no active session".to_string()));
            };

            match controller.prompt_until(text, cancel.as_mut()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_quota() => {
                    self.fall_back(e).await?;
                    self.start().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut controller) = self.controller.take() {
            controller.shutdown().await;
        }
    }

    async fn connect(&mut self, model: &str) -> Result<String> {
        self.shutdown().await;
        let mut controller = SessionController::start(
            self.connector.as_ref(),
            model,
            Rc::clone(&self.tools),
            self.options.clone(),
        )?;
        let result = controller.establish().await;
        self.controller = Some(controller);
        result
    }

    /// Tear down the current session and move to the next candidate.
    async fn fall_back(&mut self, cause: AcpError) -> Result<()> {
        self.shutdown().await;
        let transition = self.fallback.advance(&cause)?;
        tracing::info!(from = %transition.from, to = %transition.to, cause = %transition.cause, "model fallback");
        formatter::print_fallback(&transition);
        Ok(())
    }
}
