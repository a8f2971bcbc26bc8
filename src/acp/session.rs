//! Session lifecycle: handshake, authentication, session creation, prompting.
//!
//! `SessionController` owns one transport for its whole life. Every outbound
//! call is driven through `drive()`, which keeps dispatching agent-initiated
//! traffic (streamed updates, tool calls, permission requests) while the call
//! is outstanding. The dispatch branch is polled first, so every message the
//! agent sent before a response is handled before that response is returned.
//!
//! A controller is never restarted in place: model fallback drops it and
//! starts a fresh one on a new transport.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::acp::error::{AcpError, Result};
use crate::acp::message::{codes, Notification, Request, RequestId, RpcError};
use crate::acp::rpc::{Inbound, RpcRouter};
use crate::acp::streaming::Renderer;
use crate::acp::tools::{ToolCall, ToolExecutor, ToolKind, ToolStatus};
use crate::acp::transport::{Connector, ExitInfo, Transport};
use crate::acp::types::{
    InitializeResponse, NewSessionResponse, PromptResponse, RequestPermissionParams,
    SamplingParams, SessionNotification, SessionUpdate, StopReason, TurnOutcome, PROTOCOL_VERSION,
};
use crate::session_store;

/// How long to wait for the agent to end a turn after `session/cancel`.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Handshaking,
    Authenticating,
    CreatingSession,
    Active,
    AwaitingConsent,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub model: String,
    pub phase: Phase,
}

/// Which authentication exchange the agent expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// No authentication call.
    #[default]
    None,
    /// ACP `authenticate {methodId}` before `session/new`.
    Authenticate,
    /// `session/auth {sessionId, auth}` right after `session/new`.
    Session,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Method for `authenticate`; defaults to the first one the agent offers.
    pub method_id: Option<String>,
    /// API key sent with `session/auth`.
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Working directory announced in `session/new`.
    pub cwd: PathBuf,
    pub auth: AuthConfig,
    /// Where the new session id is recorded, if anywhere.
    pub session_file: Option<PathBuf>,
    /// Advertise no file-write capability.
    pub read_only: bool,
    pub cancel_grace: Duration,
}

impl SessionOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            auth: AuthConfig::default(),
            session_file: None,
            read_only: false,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

/// Accumulated state of the turn in progress.
#[derive(Default)]
struct TurnState {
    text: String,
    tool_calls: Vec<ToolCall>,
}

pub struct SessionController {
    state: SessionState,
    transport: Transport,
    router: RpcRouter,
    inbound: mpsc::Receiver<Inbound>,
    pump: JoinHandle<()>,
    tools: Rc<ToolExecutor>,
    options: SessionOptions,
    renderer: Renderer,
    turn: TurnState,
    exit: Option<ExitInfo>,
}

impl SessionController {
    /// Connecting: open a transport for `model`. Failure here is fatal.
    pub fn start(
        connector: &dyn Connector,
        model: &str,
        tools: Rc<ToolExecutor>,
        options: SessionOptions,
    ) -> Result<Self> {
        tracing::debug!(model, "connecting to agent");
        let (transport, incoming) = connector.connect(model)?;
        let (router, inbound, pump) = RpcRouter::attach(transport.outbound(), incoming);
        Ok(Self {
            state: SessionState {
                session_id: None,
                model: model.to_string(),
                phase: Phase::Connecting,
            },
            transport,
            router,
            inbound,
            pump,
            tools,
            options,
            renderer: Renderer::new(model),
            turn: TurnState::default(),
            exit: None,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.state.session_id.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.state.model
    }

    /// Exit status of the agent, once its stream has closed.
    pub fn exit_info(&self) -> Option<&ExitInfo> {
        self.exit.as_ref()
    }

    fn set_phase(&mut self, phase: Phase) {
        tracing::debug!(from = %self.state.phase, to = %phase, "session phase");
        self.state.phase = phase;
    }

    /// Handshake, optional authentication and session creation.
    ///
    /// On success the controller is `Active` and the session id is returned.
    /// Quota-class failures come back as `AcpError::Quota` for the caller's
    /// fallback; non-quota authentication failures as `AcpError::Auth`.
    pub async fn establish(&mut self) -> Result<String> {
        let result = self.establish_inner().await;
        if result.is_err() {
            self.set_phase(Phase::Terminated);
        }
        result
    }

    async fn establish_inner(&mut self) -> Result<String> {
        self.set_phase(Phase::Handshaking);
        let capabilities = json!({
            "fs": {"readTextFile": true, "writeTextFile": !self.options.read_only},
            "terminal": true,
        });
        let init = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientInfo": {"name": "acprun", "version": env!("CARGO_PKG_VERSION")},
                    "clientCapabilities": capabilities,
                    // Older agents read the unprefixed key.
                    "capabilities": capabilities,
                }),
            )
            .await?;
        let init: InitializeResponse = serde_json::from_value(init)
            .map_err(|e| AcpError::Protocol(format!("invalid initialize response: {e}")))?;

        if self.options.auth.mode == AuthMode::Authenticate {
            self.set_phase(Phase::Authenticating);
            let method_id = self
                .options
                .auth
                .method_id
                .clone()
                .or_else(|| init.auth_methods.first().map(|m| m.id.clone()));
            match method_id {
                Some(method_id) => {
                    self.request("authenticate", json!({ "methodId": method_id }))
                        .await
                        .map_err(into_auth_error)?;
                }
                None => tracing::debug!("agent offers no auth methods; skipping authenticate"),
            }
        }

        self.set_phase(Phase::CreatingSession);
        let created = self
            .request(
                "session/new",
                json!({"cwd": self.options.cwd, "mcpServers": []}),
            )
            .await?;
        let created: NewSessionResponse = serde_json::from_value(created)
            .map_err(|e| AcpError::Protocol(format!("invalid session/new response: {e}")))?;
        let session_id = created.session_id;
        self.state.session_id = Some(session_id.clone());

        if self.options.auth.mode == AuthMode::Session {
            self.set_phase(Phase::Authenticating);
            let api_key = self.options.auth.credential.clone().ok_or_else(|| {
                AcpError::Auth("session authentication needs a credential".to_string())
            })?;
            self.request(
                "session/auth",
                json!({
                    "sessionId": session_id,
                    "auth": {"type": "apiKey", "apiKey": api_key},
                }),
            )
            .await
            .map_err(into_auth_error)?;
        }

        if let Some(path) = &self.options.session_file {
            let path = self.options.cwd.join(path);
            if let Err(e) = session_store::save(&path, &session_id) {
                tracing::warn!(path = %path.display(), error = %e, "failed to persist session");
            }
        }

        self.set_phase(Phase::Active);
        tracing::debug!(session_id = %session_id, model = %self.state.model, "session active");
        Ok(session_id)
    }

    /// Run one prompt turn to completion.
    pub async fn prompt(&mut self, text: &str) -> Result<TurnOutcome> {
        self.prompt_until(text, std::future::pending()).await
    }

    /// Run one prompt turn; when `cancel` resolves, ask the agent to stop.
    ///
    /// After `session/cancel` the agent gets `cancel_grace` to end the turn
    /// on its own before the turn is reported as cancelled.
    pub async fn prompt_until<C>(&mut self, text: &str, cancel: C) -> Result<TurnOutcome>
    where
        C: Future<Output = ()>,
    {
        // Traffic that trailed the previous turn's response is rendered as
        // that turn's output before this turn starts counting.
        self.drain_ready().await;
        self.renderer.finish();

        let session_id = match (&self.state.session_id, self.state.phase) {
            (_, Phase::Terminated) => {
                return Err(AcpError::Transport(match &self.exit {
                    Some(info) => info.to_string(),
                    None => "session is terminated".to_string(),
                }))
            }
            (Some(id), _) => id.clone(),
            (None, _) => return Err(AcpError::Protocol("no session established".to_string())),
        };

        let started = Instant::now();
        self.turn = TurnState::default();
        self.tools.take_files_modified();

        let router = self.router.clone();
        let call = router.call(
            "session/prompt",
            json!({
                "sessionId": session_id,
                "prompt": [{"type": "text", "text": text}],
            }),
        );
        let result = self.drive(call, cancel).await;
        // Updates that raced the response still belong to this turn.
        self.drain_ready().await;

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.renderer.finish();
                if self.router.is_closed() {
                    self.set_phase(Phase::Terminated);
                }
                return Err(e.into_quota_if_classified());
            }
        };

        let response: PromptResponse = serde_json::from_value(value)
            .map_err(|e| AcpError::Protocol(format!("invalid session/prompt response: {e}")))?;
        for text in response.content.iter().filter_map(|b| b.as_text()) {
            self.renderer.agent_text(text);
            self.turn.text.push_str(text);
        }
        self.renderer.finish();

        let stop_reason = match response.stop_reason.as_deref() {
            Some(raw) => StopReason::parse(raw),
            None if self.turn.text.trim().is_empty() && self.turn.tool_calls.is_empty() => {
                return Err(AcpError::Quota("empty response from agent".to_string()));
            }
            None => StopReason::EndTurn,
        };

        let turn = std::mem::take(&mut self.turn);
        Ok(TurnOutcome {
            stop_reason,
            text: turn.text,
            tool_calls: turn.tool_calls,
            files_modified: self.tools.take_files_modified(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Kill the agent and fail anything still pending. Safe to call twice.
    pub async fn shutdown(&mut self) {
        self.set_phase(Phase::Terminated);
        self.router.fail_all("session shut down");
        self.transport.close().await;
        self.pump.abort();
    }

    /// A call outside a turn, with quota classification applied.
    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let router = self.router.clone();
        self.drive(router.call(method, params), std::future::pending())
            .await
            .map_err(AcpError::into_quota_if_classified)
    }

    /// Await `call` while dispatching agent-initiated traffic.
    async fn drive<F, C>(&mut self, call: F, cancel: C) -> Result<Value>
    where
        F: Future<Output = Result<Value>>,
        C: Future<Output = ()>,
    {
        tokio::pin!(call);
        tokio::pin!(cancel);
        let grace = tokio::time::sleep(self.options.cancel_grace);
        tokio::pin!(grace);
        let mut cancel_sent = false;

        loop {
            tokio::select! {
                biased;
                Some(inbound) = self.inbound.recv() => self.dispatch(inbound).await,
                result = &mut call => return result,
                _ = &mut cancel, if !cancel_sent => {
                    cancel_sent = true;
                    self.send_cancel();
                    grace
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.options.cancel_grace);
                }
                _ = &mut grace, if cancel_sent => {
                    tracing::debug!("agent did not end the turn after cancel");
                    return Ok(json!({"stopReason": StopReason::Cancelled.as_str()}));
                }
            }
        }
    }

    fn send_cancel(&self) {
        let Some(session_id) = &self.state.session_id else {
            return;
        };
        tracing::debug!(session_id = %session_id, "cancelling turn");
        if let Err(e) = self
            .router
            .notify("session/cancel", json!({ "sessionId": session_id }))
        {
            tracing::debug!(error = %e, "failed to send session/cancel");
        }
    }

    /// Dispatch whatever is already queued, without waiting.
    async fn drain_ready(&mut self) {
        while let Ok(inbound) = self.inbound.try_recv() {
            self.dispatch(inbound).await;
        }
    }

    async fn dispatch(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Notification(notification) => self.on_notification(notification).await,
            Inbound::Request(request) => self.on_request(request).await,
            Inbound::Closed(info) => {
                tracing::debug!(%info, "agent stream closed");
                self.exit = Some(info);
                self.set_phase(Phase::Terminated);
            }
        }
    }

    async fn on_notification(&mut self, notification: Notification) {
        match notification.method.as_str() {
            "session/update" => {
                match serde_json::from_value::<SessionNotification>(notification.params) {
                    Ok(update) => self.on_session_update(update.update),
                    Err(e) => tracing::warn!(error = %e, "dropping malformed session/update"),
                }
            }
            "sampling/createMessage" => self.on_sampling(None, notification.params).await,
            other => tracing::debug!(method = other, "ignoring notification"),
        }
    }

    fn on_session_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::AgentMessageChunk { content } => {
                if let Some(text) = content.as_text() {
                    self.turn.text.push_str(text);
                    self.renderer.agent_text(text);
                }
            }
            SessionUpdate::AgentThoughtChunk { content } => {
                if let Some(text) = content.as_text() {
                    self.renderer.thought(text);
                }
            }
            SessionUpdate::ToolCall {
                tool_call_id,
                title,
                status,
            } => {
                tracing::debug!(id = %tool_call_id, status = ?status, "agent tool call");
                self.renderer.tool_announced(&title);
            }
            SessionUpdate::ToolCallUpdate {
                tool_call_id,
                title,
                status,
            } => {
                tracing::trace!(id = %tool_call_id, title = ?title, status = ?status, "tool call update");
            }
            SessionUpdate::Other => {}
        }
    }

    async fn on_request(&mut self, request: Request) {
        let Request { id, method, params } = request;
        match method.as_str() {
            "sampling/createMessage" => self.on_sampling(Some(id), params).await,
            "session/request_permission" => {
                let outcome = match serde_json::from_value::<RequestPermissionParams>(params) {
                    Ok(params) => {
                        let previous = self.state.phase;
                        self.set_phase(Phase::AwaitingConsent);
                        let outcome = self.tools.request_permission(&params).await;
                        self.set_phase(previous);
                        Ok(outcome)
                    }
                    Err(e) => Err(RpcError::invalid_params(e.to_string())),
                };
                self.respond(id, outcome);
            }
            name if ToolKind::from_name(name).is_some() => {
                let call = self.run_tool(ToolCall::new(id.to_string(), name, params)).await;
                let outcome = match (call.status, &call.output) {
                    (ToolStatus::Completed, Some(output)) => Ok(output.to_value()),
                    (ToolStatus::Rejected, _) => Err(RpcError::new(
                        codes::REQUEST_REJECTED,
                        "tool call rejected by user",
                    )),
                    _ => Err(RpcError::internal_error(call.result_text())),
                };
                self.respond(id, outcome);
            }
            other => {
                tracing::debug!(method = other, "unsupported client method");
                self.respond(id, Err(RpcError::method_not_found(other)));
            }
        }
    }

    /// Run every `tool_use` block of a sampling message and relay results.
    ///
    /// A request gets a response carrying `tool_result` blocks; a
    /// notification gets a `tool/result` notification with the same blocks.
    /// Rejected and failed calls are `is_error: true` results, never
    /// JSON-RPC errors, so the agent's turn can conclude either way.
    async fn on_sampling(&mut self, id: Option<RequestId>, params: Value) {
        let sampling: SamplingParams = match serde_json::from_value(params) {
            Ok(sampling) => sampling,
            Err(e) => {
                tracing::warn!(error = %e, "malformed sampling/createMessage");
                if let Some(id) = id {
                    self.respond(id, Err(RpcError::invalid_params(e.to_string())));
                }
                return;
            }
        };

        let text = sampling.text();
        if !text.is_empty() {
            self.turn.text.push_str(&text);
            self.renderer.agent_text(&text);
        }

        let uses = sampling.tool_uses();
        if uses.is_empty() {
            if let Some(id) = id {
                self.respond(
                    id,
                    Err(RpcError::invalid_params("no tool_use content to execute")),
                );
            }
            return;
        }

        let mut blocks = Vec::with_capacity(uses.len());
        for tool_use in uses {
            let call = self
                .run_tool(ToolCall::new(tool_use.id, tool_use.name, tool_use.input))
                .await;
            blocks.push(tool_result_block(&call));
        }

        match id {
            Some(id) => self.respond(id, Ok(json!({"role": "user", "content": blocks}))),
            None => {
                let params = json!({"sessionId": self.state.session_id, "content": blocks});
                if let Err(e) = self.router.notify("tool/result", params) {
                    tracing::debug!(error = %e, "failed to send tool/result");
                }
            }
        }
    }

    async fn run_tool(&mut self, call: ToolCall) -> ToolCall {
        let previous = self.state.phase;
        self.set_phase(Phase::AwaitingConsent);
        self.renderer.tool_call(&call.name, &call.input);

        let call = self.tools.execute(call).await;

        self.renderer.tool_finished(&call);
        self.turn.tool_calls.push(call.clone());
        self.set_phase(previous);
        call
    }

    fn respond(&self, id: RequestId, outcome: std::result::Result<Value, RpcError>) {
        if let Err(e) = self.router.respond(id, outcome) {
            tracing::debug!(error = %e, "failed to answer agent request");
        }
    }
}

fn tool_result_block(call: &ToolCall) -> Value {
    json!({
        "type": "tool_result",
        "tool_use_id": call.id,
        "content": [{"type": "text", "text": call.result_text()}],
        "is_error": call.is_error(),
    })
}

/// Authentication failures are fatal unless they look like quota.
fn into_auth_error(e: AcpError) -> AcpError {
    match e {
        e @ (AcpError::Quota(_) | AcpError::Transport(_)) => e,
        other => AcpError::Auth(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::message::Message;
    use crate::acp::testing::{FakeAgent, ScriptedConnector};
    use crate::acp::tools::{AutoApprove, Capabilities, ConsentSource, DenyAll, ShellOutput};
    use async_trait::async_trait;
    use std::cell::RefCell;
    use std::path::Path;
    use tokio::task::LocalSet;

    macro_rules! with_local_set {
        ($body:expr) => {{
            let local = LocalSet::new();
            local.run_until($body).await;
        }};
    }

    #[derive(Default, Clone)]
    struct Recorder {
        calls: Rc<RefCell<Vec<String>>>,
    }

    #[async_trait(?Send)]
    impl Capabilities for Recorder {
        async fn run_shell(&self, command: &str) -> Result<ShellOutput> {
            self.calls.borrow_mut().push(format!("shell:{command}"));
            Ok(ShellOutput {
                stdout: "Cargo.toml\nsrc\n".into(),
                exit_code: 0,
            })
        }

        async fn read_file(&self, path: &Path) -> Result<Option<String>> {
            self.calls.borrow_mut().push(format!("read:{}", path.display()));
            Ok(Some("line1\nline2\n".into()))
        }

        async fn write_file(&self, path: &Path, _content: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("write:{}", path.display()));
            Ok(())
        }
    }

    fn tools(consent: Box<dyn ConsentSource>, recorder: &Recorder) -> Rc<ToolExecutor> {
        Rc::new(ToolExecutor::new(
            consent,
            Box::new(recorder.clone()),
            PathBuf::from("/work"),
        ))
    }

    /// Answer initialize and session/new.
    async fn handshake(agent: &mut FakeAgent, session_id: &str) {
        let init = agent.expect("initialize").await;
        assert_eq!(init.params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init.params["clientInfo"]["name"], "acprun");
        agent
            .reply(init.id, json!({"protocolVersion": 1, "authMethods": []}))
            .await;
        let new = agent.expect("session/new").await;
        assert_eq!(new.params["cwd"], "/work");
        assert_eq!(new.params["mcpServers"], json!([]));
        agent.reply(new.id, json!({"sessionId": session_id})).await;
    }

    fn shell_tool_use(id: &str, command: &str) -> Value {
        json!({
            "sessionId": "sess-1",
            "content": [
                {"type": "text", "text": "Listing files. "},
                {"type": "tool_use", "id": id, "name": "terminal/execute", "input": {"command": command}}
            ]
        })
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_list_files_scenario() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _model| async move {
                handshake(&mut agent, "sess-1").await;
                let prompt = agent.expect("session/prompt").await;
                assert_eq!(prompt.params["prompt"][0]["text"], "list files");

                agent
                    .notify(
                        "session/update",
                        json!({"sessionId": "sess-1", "update": {
                            "sessionUpdate": "agent_thought_chunk",
                            "content": {"type": "text", "text": "thinking"}}}),
                    )
                    .await;
                agent
                    .send(Message::Request(Request {
                        id: RequestId::Text("sample-1".into()),
                        method: "sampling/createMessage".into(),
                        params: shell_tool_use("call_1", "ls -la"),
                    }))
                    .await;

                match agent.recv().await {
                    Message::Response(resp) => {
                        assert_eq!(resp.id, RequestId::Text("sample-1".into()));
                        let result = resp.outcome.unwrap();
                        let block = &result["content"][0];
                        assert_eq!(block["type"], "tool_result");
                        assert_eq!(block["tool_use_id"], "call_1");
                        assert_eq!(block["is_error"], false);
                        assert_eq!(block["content"][0]["text"], "Cargo.toml\nsrc\n");
                    }
                    other => panic!("expected tool result, got {other:?}"),
                }

                agent
                    .notify(
                        "session/update",
                        json!({"sessionId": "sess-1", "update": {
                            "sessionUpdate": "agent_message_chunk",
                            "content": {"type": "text", "text": "Done."}}}),
                    )
                    .await;
                agent.reply(prompt.id, json!({"stopReason": "end_turn"})).await;
                let _ = agent.try_recv().await;
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "model-a",
                tools(Box::new(AutoApprove), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            assert_eq!(session.state().phase, Phase::Connecting);

            assert_eq!(session.establish().await.unwrap(), "sess-1");
            assert_eq!(session.state().phase, Phase::Active);

            let outcome = session.prompt("list files").await.unwrap();
            assert_eq!(outcome.stop_reason, StopReason::EndTurn);
            assert_eq!(outcome.text, "Listing files. Done.");
            assert_eq!(outcome.tool_calls.len(), 1);
            assert_eq!(outcome.tool_calls[0].status, ToolStatus::Completed);
            assert_eq!(*recorder.calls.borrow(), vec!["shell:ls -la".to_string()]);
            assert_eq!(session.state().phase, Phase::Active);

            session.shutdown().await;
            assert_eq!(session.state().phase, Phase::Terminated);
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_denied_consent_still_concludes_turn() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-1").await;
                let prompt = agent.expect("session/prompt").await;
                agent
                    .notify("sampling/createMessage", shell_tool_use("call_9", "rm -rf /"))
                    .await;

                match agent.recv().await {
                    Message::Notification(n) => {
                        assert_eq!(n.method, "tool/result");
                        assert_eq!(n.params["sessionId"], "sess-1");
                        assert_eq!(n.params["content"][0]["tool_use_id"], "call_9");
                        assert_eq!(n.params["content"][0]["is_error"], true);
                    }
                    other => panic!("expected tool/result, got {other:?}"),
                }
                agent.reply(prompt.id, json!({"stopReason": "end_turn"})).await;
                let _ = agent.try_recv().await;
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "model-a",
                tools(Box::new(DenyAll), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            session.establish().await.unwrap();

            let outcome = session.prompt("clean up").await.unwrap();
            assert_eq!(outcome.stop_reason, StopReason::EndTurn);
            assert_eq!(outcome.tool_calls[0].status, ToolStatus::Rejected);
            assert!(recorder.calls.borrow().is_empty(), "no capability may run");
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_sampling_with_plain_string_message_runs_tool() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-1").await;
                let prompt = agent.expect("session/prompt").await;
                agent
                    .notify(
                        "sampling/createMessage",
                        json!({
                            "messages": [{"role": "assistant", "content": "I need to check the system."}],
                            "content": [
                                {"type": "text", "text": "I will run a command to check files."},
                                {"type": "tool_use", "id": "call_001", "name": "terminal/execute",
                                 "input": {"command": "ls -la"}}
                            ]
                        }),
                    )
                    .await;

                match agent.recv().await {
                    Message::Notification(n) => {
                        assert_eq!(n.method, "tool/result");
                        assert_eq!(n.params["content"][0]["tool_use_id"], "call_001");
                        assert_eq!(n.params["content"][0]["is_error"], false);
                    }
                    other => panic!("expected tool/result, got {other:?}"),
                }
                agent.reply(prompt.id, json!({"stopReason": "tool_use"})).await;
                let _ = agent.try_recv().await;
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "model-a",
                tools(Box::new(AutoApprove), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            session.establish().await.unwrap();

            let outcome = session.prompt("list files").await.unwrap();
            assert_eq!(outcome.stop_reason, StopReason::ToolUse);
            assert_eq!(outcome.tool_calls.len(), 1);
            assert_eq!(outcome.tool_calls[0].status, ToolStatus::Completed);
            assert_eq!(*recorder.calls.borrow(), vec!["shell:ls -la".to_string()]);
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_update_after_response_stays_with_its_turn() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-1").await;
                let chunk = |text: &str| {
                    json!({"sessionId": "sess-1", "update": {
                        "sessionUpdate": "agent_message_chunk",
                        "content": {"type": "text", "text": text}}})
                };

                let first = agent.expect("session/prompt").await;
                agent.notify("session/update", chunk("one")).await;
                agent.reply(first.id, json!({"stopReason": "end_turn"})).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                agent.notify("session/update", chunk(" trailing")).await;

                let second = agent.expect("session/prompt").await;
                agent.notify("session/update", chunk("two")).await;
                agent.reply(second.id, json!({"stopReason": "end_turn"})).await;
                let _ = agent.try_recv().await;
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "model-a",
                tools(Box::new(AutoApprove), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            session.establish().await.unwrap();

            let first = session.prompt("first").await.unwrap();
            assert_eq!(first.text, "one");

            tokio::time::sleep(Duration::from_millis(60)).await;
            let second = session.prompt("second").await.unwrap();
            assert_eq!(second.text, "two");
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_tool_use_stop_reason_is_reported() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-1").await;
                let prompt = agent.expect("session/prompt").await;
                agent
                    .notify("sampling/createMessage", shell_tool_use("call_2", "pwd"))
                    .await;
                // Respond without waiting for the result.
                agent.reply(prompt.id, json!({"stopReason": "tool_use"})).await;
                let _ = agent.try_recv().await;
                let _ = agent.try_recv().await;
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            session.establish().await.unwrap();
            let outcome = session.prompt("where am i").await.unwrap();
            assert_eq!(outcome.stop_reason, StopReason::ToolUse);
            // The notification preceded the response, so the tool already ran.
            assert_eq!(*recorder.calls.borrow(), vec!["shell:pwd".to_string()]);
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_session_auth_after_session_new() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-7").await;
                let auth = agent.expect("session/auth").await;
                assert_eq!(auth.params["sessionId"], "sess-7");
                assert_eq!(auth.params["auth"]["type"], "apiKey");
                assert_eq!(auth.params["auth"]["apiKey"], "secret");
                agent.reply(auth.id, json!({"ok": true})).await;
                let _ = agent.try_recv().await;
            });

            let mut options = SessionOptions::new("/work");
            options.auth = AuthConfig {
                mode: AuthMode::Session,
                method_id: None,
                credential: Some("secret".into()),
            };
            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                options,
            )
            .unwrap();
            assert_eq!(session.establish().await.unwrap(), "sess-7");
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_authenticate_failure_is_fatal_auth_error() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                let init = agent.expect("initialize").await;
                agent
                    .reply(
                        init.id,
                        json!({"protocolVersion": 1, "authMethods": [{"id": "oauth-personal"}]}),
                    )
                    .await;
                let auth = agent.expect("authenticate").await;
                assert_eq!(auth.params["methodId"], "oauth-personal");
                agent
                    .send(Message::response(
                        auth.id,
                        Err(RpcError::new(-32000, "Authentication required")),
                    ))
                    .await;
                let _ = agent.try_recv().await;
            });

            let mut options = SessionOptions::new("/work");
            options.auth.mode = AuthMode::Authenticate;
            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                options,
            )
            .unwrap();
            match session.establish().await {
                Err(AcpError::Auth(msg)) => assert!(msg.contains("Authentication required")),
                other => panic!("expected auth error, got {other:?}"),
            }
            assert_eq!(session.state().phase, Phase::Terminated);
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_quota_error_during_handshake_is_quota() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                let init = agent.expect("initialize").await;
                agent
                    .send(Message::response(
                        init.id,
                        Err(RpcError::new(429, "RESOURCE_EXHAUSTED: quota exceeded")),
                    ))
                    .await;
                let _ = agent.try_recv().await;
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            assert!(matches!(session.establish().await, Err(AcpError::Quota(_))));
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_empty_prompt_response_is_quota_class() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-1").await;
                let prompt = agent.expect("session/prompt").await;
                agent.reply(prompt.id, json!({})).await;
                let _ = agent.try_recv().await;
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            session.establish().await.unwrap();
            let err = session.prompt("hello").await.unwrap_err();
            assert!(err.is_quota(), "{err}");
            assert!(err.to_string().contains("empty response"));
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_non_quota_prompt_error_keeps_session_active() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-1").await;
                let first = agent.expect("session/prompt").await;
                agent
                    .send(Message::response(
                        first.id,
                        Err(RpcError::invalid_params("prompt too long")),
                    ))
                    .await;
                let second = agent.expect("session/prompt").await;
                agent
                    .reply(
                        second.id,
                        json!({"stopReason": "end_turn", "content": [{"type": "text", "text": "ok"}]}),
                    )
                    .await;
                let _ = agent.try_recv().await;
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            session.establish().await.unwrap();

            let err = session.prompt("a".repeat(10).as_str()).await.unwrap_err();
            assert!(matches!(err, AcpError::Rpc { .. }));
            assert_eq!(session.state().phase, Phase::Active);

            let outcome = session.prompt("again").await.unwrap();
            assert_eq!(outcome.text, "ok");
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancel_sends_session_cancel() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-1").await;
                let prompt = agent.expect("session/prompt").await;
                match agent.recv().await {
                    Message::Notification(n) => {
                        assert_eq!(n.method, "session/cancel");
                        assert_eq!(n.params["sessionId"], "sess-1");
                    }
                    other => panic!("expected session/cancel, got {other:?}"),
                }
                agent.reply(prompt.id, json!({"stopReason": "cancelled"})).await;
                let _ = agent.try_recv().await;
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            session.establish().await.unwrap();

            let cancel = tokio::time::sleep(Duration::from_millis(20));
            let outcome = session.prompt_until("long task", cancel).await.unwrap();
            assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancel_grace_expires_when_agent_ignores_cancel() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-1").await;
                agent.expect("session/prompt").await;
                // Never answer; wait for the client to hang up.
                while agent.try_recv().await.is_some() {}
            });

            let mut options = SessionOptions::new("/work");
            options.cancel_grace = Duration::from_millis(50);
            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                options,
            )
            .unwrap();
            session.establish().await.unwrap();

            let cancel = tokio::time::sleep(Duration::from_millis(10));
            let outcome = session.prompt_until("stuck", cancel).await.unwrap();
            assert_eq!(outcome.stop_reason, StopReason::Cancelled);
            session.shutdown().await;
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_direct_client_methods() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-1").await;
                let prompt = agent.expect("session/prompt").await;

                agent
                    .send(Message::Request(Request {
                        id: RequestId::Number(100),
                        method: "fs/read_text_file".into(),
                        params: json!({"sessionId": "sess-1", "path": "/work/a.txt", "line": 2}),
                    }))
                    .await;
                match agent.recv().await {
                    Message::Response(r) => assert_eq!(r.outcome.unwrap()["content"], "line2"),
                    other => panic!("expected read response, got {other:?}"),
                }

                agent
                    .send(Message::Request(Request {
                        id: RequestId::Number(101),
                        method: "terminal/create".into(),
                        params: json!({}),
                    }))
                    .await;
                match agent.recv().await {
                    Message::Response(r) => {
                        assert_eq!(r.outcome.unwrap_err().code, Some(codes::METHOD_NOT_FOUND))
                    }
                    other => panic!("expected error response, got {other:?}"),
                }

                agent
                    .send(Message::Request(Request {
                        id: RequestId::Number(102),
                        method: "session/request_permission".into(),
                        params: json!({
                            "sessionId": "sess-1",
                            "toolCall": {"toolCallId": "t1", "title": "Edit", "kind": "edit"},
                            "options": [
                                {"optionId": "yes", "name": "Allow", "kind": "allow_once"},
                                {"optionId": "no", "name": "Reject", "kind": "reject_once"}
                            ]
                        }),
                    }))
                    .await;
                match agent.recv().await {
                    Message::Response(r) => {
                        assert_eq!(r.outcome.unwrap()["outcome"]["optionId"], "yes")
                    }
                    other => panic!("expected permission response, got {other:?}"),
                }

                agent.reply(prompt.id, json!({"stopReason": "end_turn"})).await;
                let _ = agent.try_recv().await;
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            session.establish().await.unwrap();
            let outcome = session.prompt("go").await.unwrap();
            assert_eq!(outcome.stop_reason, StopReason::EndTurn);
            assert_eq!(*recorder.calls.borrow(), vec!["read:/work/a.txt".to_string()]);
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_agent_exit_mid_turn_terminates_session() {
        with_local_set!(async {
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-1").await;
                agent.expect("session/prompt").await;
                drop(agent);
            });

            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                SessionOptions::new("/work"),
            )
            .unwrap();
            session.establish().await.unwrap();

            assert!(matches!(
                session.prompt("hi").await,
                Err(AcpError::Transport(_))
            ));
            assert_eq!(session.state().phase, Phase::Terminated);
            assert!(session.exit_info().is_some());
            assert!(session.prompt("again").await.is_err());
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_session_id_is_persisted() {
        with_local_set!(async {
            let tmp = tempfile::TempDir::new().unwrap();
            let connector = ScriptedConnector::default().then(|mut agent, _| async move {
                handshake(&mut agent, "sess-42").await;
                let _ = agent.try_recv().await;
            });

            let mut options = SessionOptions::new("/work");
            options.session_file = Some(tmp.path().join(".acp-session.json"));
            let recorder = Recorder::default();
            let mut session = SessionController::start(
                &connector,
                "m",
                tools(Box::new(AutoApprove), &recorder),
                options,
            )
            .unwrap();
            session.establish().await.unwrap();

            let saved = session_store::load(&tmp.path().join(".acp-session.json"))
                .unwrap()
                .unwrap();
            assert_eq!(saved.session_id, "sess-42");
        });
    }
}
