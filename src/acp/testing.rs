//! In-memory agents for unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::acp::codec::{FrameCodec, Framing};
use crate::acp::error::{AcpError, Result};
use crate::acp::message::{Message, Request, RequestId};
use crate::acp::transport::{Connector, Incoming, Transport};

/// The agent end of an in-memory transport. Dropping it closes the stream.
pub(crate) struct FakeAgent {
    reader: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
    writer: FramedWrite<WriteHalf<DuplexStream>, FrameCodec>,
}

pub(crate) fn duplex_agent(framing: Framing) -> (Transport, Incoming, FakeAgent) {
    let (client, agent) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (agent_read, agent_write) = tokio::io::split(agent);
    let (transport, incoming) = Transport::from_io(client_read, client_write, framing);
    let agent = FakeAgent {
        reader: FramedRead::new(agent_read, FrameCodec::new(framing)),
        writer: FramedWrite::new(agent_write, FrameCodec::new(framing)),
    };
    (transport, incoming, agent)
}

impl FakeAgent {
    /// Next message from the client, or `None` once it hung up.
    pub async fn try_recv(&mut self) -> Option<Message> {
        match self.reader.next().await {
            Some(Ok(message)) => Some(message),
            _ => None,
        }
    }

    pub async fn recv(&mut self) -> Message {
        self.try_recv().await.expect("client closed the stream")
    }

    pub async fn recv_request(&mut self) -> Request {
        match self.recv().await {
            Message::Request(request) => request,
            other => panic!("expected a request, got {other:?}"),
        }
    }

    /// Receive a request and assert its method.
    pub async fn expect(&mut self, method: &str) -> Request {
        let request = self.recv_request().await;
        assert_eq!(request.method, method, "unexpected request {request:?}");
        request
    }

    pub async fn send(&mut self, message: Message) {
        self.writer.send(message).await.expect("write to client");
    }

    pub async fn reply(&mut self, id: RequestId, result: Value) {
        self.send(Message::response(id, Ok(result))).await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(Message::notification(method, params)).await;
    }
}

type Script = Box<dyn FnOnce(FakeAgent, String) -> Pin<Box<dyn Future<Output = ()>>>>;

/// Connector that hands each new transport to the next scripted agent.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    scripts: RefCell<VecDeque<Script>>,
    pub connected: Rc<RefCell<Vec<String>>>,
}

impl ScriptedConnector {
    pub fn then<F, Fut>(self, script: F) -> Self
    where
        F: FnOnce(FakeAgent, String) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.scripts
            .borrow_mut()
            .push_back(Box::new(move |agent, model| Box::pin(script(agent, model))));
        self
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, model: &str) -> Result<(Transport, Incoming)> {
        let script = self
            .scripts
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| AcpError::Transport("no scripted agent left".into()))?;
        self.connected.borrow_mut().push(model.to_string());
        let (transport, incoming, agent) = duplex_agent(Framing::Newline);
        tokio::task::spawn_local(script(agent, model.to_string()));
        Ok((transport, incoming))
    }
}
