//! Agent transport: process spawning and the framed duplex byte stream.
//!
//! A `Transport` owns the agent child process (or any reader/writer pair)
//! and three local tasks:
//! - a reader that decodes frames and forwards them as `TransportEvent`s,
//! - a writer that encodes outbound messages onto the agent's stdin,
//! - a stderr forwarder that logs agent diagnostics and keeps a short tail.
//!
//! When the agent's output ends, the reader emits one final
//! `TransportEvent::Closed` carrying the exit status and stderr tail; it never
//! raises an error mid-stream.
//!
//! All tasks are `spawn_local`, so construction must happen inside a
//! `tokio::task::LocalSet`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::rc::Rc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::acp::codec::{FrameCodec, Framing};
use crate::acp::error::{AcpError, Result};
use crate::acp::message::Message;

/// Number of agent stderr lines retained for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Capacity of the inbound event channel.
const INCOMING_CAPACITY: usize = 64;

/// How long to wait for the exit status once the agent's stdout closes.
const EXIT_WAIT: Duration = Duration::from_millis(500);

// ============================================================================
// Process description
// ============================================================================

/// How to start an agent process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Environment overrides applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

impl ProcessSpec {
    /// Parse a shell-style command line into a spec.
    ///
    /// Uses `shlex::split()` for POSIX-style tokenisation, supporting quoted
    /// arguments and escaped spaces.
    pub fn parse(command: &str, cwd: impl Into<PathBuf>) -> Result<Self> {
        let parts = shlex::split(command).ok_or_else(|| {
            AcpError::Transport(format!("invalid agent command: failed to parse \"{command}\""))
        })?;
        let mut iter = parts.into_iter();
        let program = iter
            .next()
            .ok_or_else(|| AcpError::Transport("agent command is empty".to_string()))?;
        Ok(Self {
            program,
            args: iter.collect(),
            env: Vec::new(),
            cwd: cwd.into(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

// ============================================================================
// Events
// ============================================================================

/// How the agent's stream ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitInfo {
    /// Exit code, or `None` when killed by a signal or not a process.
    pub code: Option<i32>,
    /// Last lines the agent wrote to stderr.
    pub stderr_tail: Vec<String>,
}

impl ExitInfo {
    pub fn is_failure(&self) -> bool {
        matches!(self.code, Some(code) if code != 0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "agent exited with status {code}")?,
            None => write!(f, "agent stream closed")?,
        }
        if !self.stderr_tail.is_empty() {
            write!(f, ": {}", self.stderr_tail.join(" | "))?;
        }
        Ok(())
    }
}

/// One item of the inbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Message),
    /// Terminal marker; nothing follows it.
    Closed(ExitInfo),
}

/// Receiving half of a transport, in arrival order.
pub struct Incoming {
    rx: mpsc::Receiver<TransportEvent>,
}

impl Incoming {
    /// Next event, or `None` once the closed marker has been consumed.
    pub async fn next(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// Cloneable sending handle.
///
/// Sends fail with `AcpError::Transport` once the writer task has stopped.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbound {
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| AcpError::Transport("agent input stream is closed".to_string()))
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct Transport {
    outbound: Outbound,
    /// Signals the supervisor task to kill the child.
    kill: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

/// Everything the reader needs to build the final `ExitInfo`.
struct ExitWatch {
    exit_rx: oneshot::Receiver<Option<i32>>,
    stderr_tail: Rc<RefCell<VecDeque<String>>>,
    stderr_task: JoinHandle<()>,
}

impl ExitWatch {
    async fn collect(self) -> ExitInfo {
        let code = tokio::time::timeout(EXIT_WAIT, self.exit_rx)
            .await
            .ok()
            .and_then(|r| r.ok())
            .flatten();
        // Let the stderr reader drain what the process wrote before exiting.
        let _ = tokio::time::timeout(EXIT_WAIT, self.stderr_task).await;
        let stderr_tail = self.stderr_tail.borrow().iter().cloned().collect();
        ExitInfo { code, stderr_tail }
    }
}

impl Transport {
    /// Spawn the agent process and start the I/O tasks.
    pub fn spawn(spec: &ProcessSpec, framing: Framing) -> Result<(Transport, Incoming)> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&spec.cwd)
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            AcpError::Transport(format!("failed to spawn agent '{}': {e}", spec.program))
        })?;
        tracing::debug!(program = %spec.program, args = ?spec.args, pid = ?child.id(), "spawned agent");

        let missing = |stream: &str| AcpError::Transport(format!("agent {stream} was not piped"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let stderr_tail = Rc::new(RefCell::new(VecDeque::new()));
        let stderr_task = tokio::task::spawn_local(forward_stderr(stderr, Rc::clone(&stderr_tail)));

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::task::spawn_local(supervise(child, kill_rx, exit_tx));

        let watch = ExitWatch {
            exit_rx,
            stderr_tail,
            stderr_task,
        };
        let (mut transport, incoming) = Self::start(stdout, stdin, framing, Some(watch));
        transport.kill = Some(kill_tx);
        transport.supervisor = Some(supervisor);
        Ok((transport, incoming))
    }

    /// Run the protocol over an arbitrary reader/writer pair (socket, pipe).
    pub fn from_io<R, W>(reader: R, writer: W, framing: Framing) -> (Transport, Incoming)
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        Self::start(reader, writer, framing, None)
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        framing: Framing,
        watch: Option<ExitWatch>,
    ) -> (Transport, Incoming)
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel(INCOMING_CAPACITY);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::task::spawn_local(read_loop(reader, framing, event_tx, watch));
        let writer_task = tokio::task::spawn_local(write_loop(writer, framing, out_rx));

        let transport = Transport {
            outbound: Outbound { tx: out_tx },
            kill: None,
            supervisor: None,
            tasks: vec![reader_task, writer_task],
            closed: false,
        };
        (transport, Incoming { rx: event_rx })
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Queue one message for the agent.
    pub fn send(&self, message: Message) -> Result<()> {
        if self.closed {
            return Err(AcpError::Transport("transport is closed".to_string()));
        }
        self.outbound.send(message)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Kill the agent and stop all I/O tasks. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(supervisor) = self.supervisor.take() {
            // Wait for the kill to land so no zombie outlives the transport.
            let _ = supervisor.await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::debug!("transport closed");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Dropping `kill` lets the supervisor reap the child on its own.
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

async fn read_loop<R>(
    reader: R,
    framing: Framing,
    tx: mpsc::Sender<TransportEvent>,
    watch: Option<ExitWatch>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new(framing));
    while let Some(item) = frames.next().await {
        match item {
            Ok(message) => {
                if tx.send(TransportEvent::Message(message)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "agent output stream failed");
                break;
            }
        }
    }

    let info = match watch {
        Some(watch) => watch.collect().await,
        None => ExitInfo::default(),
    };
    tracing::debug!(code = ?info.code, "agent output stream ended");
    let _ = tx.send(TransportEvent::Closed(info)).await;
}

async fn write_loop<W>(writer: W, framing: Framing, mut rx: mpsc::UnboundedReceiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedWrite::new(writer, FrameCodec::new(framing));
    while let Some(message) = rx.recv().await {
        if let Err(e) = frames.send(message).await {
            tracing::warn!(error = %e, "failed to write to agent");
            break;
        }
    }
}

/// Own the child: report its exit code, or kill it when asked.
///
/// A dropped `kill` sender counts as a kill request.
async fn supervise(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<Option<i32>>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = kill => {
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    };
    let _ = exit_tx.send(status.and_then(|s| s.code()));
}

async fn forward_stderr(stderr: ChildStderr, tail: Rc<RefCell<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        tracing::debug!(target: "acprun::agent", "{line}");
        let mut tail = tail.borrow_mut();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

// ============================================================================
// Connectors
// ============================================================================

/// Factory for fresh transports, one per session attempt.
pub trait Connector {
    fn connect(&self, model: &str) -> Result<(Transport, Incoming)>;
}

/// Spawns the configured agent command, passing the model name through the
/// environment and, optionally, a command-line flag.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    pub spec: ProcessSpec,
    pub framing: Framing,
    pub model_env: Option<String>,
    pub model_arg: Option<String>,
}

impl ProcessConnector {
    /// The concrete spec used for `model`.
    pub fn spec_for(&self, model: &str) -> ProcessSpec {
        let mut spec = self.spec.clone();
        if let Some(var) = &self.model_env {
            spec = spec.env(var.clone(), model);
        }
        if let Some(flag) = &self.model_arg {
            spec = spec.arg(flag.clone()).arg(model);
        }
        spec
    }
}

impl Connector for ProcessConnector {
    fn connect(&self, model: &str) -> Result<(Transport, Incoming)> {
        Transport::spawn(&self.spec_for(model), self.framing)
    }
}

// ============================================================================
// Unit tests
// ============================================================================
