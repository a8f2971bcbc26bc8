//! ACP (Agent Client Protocol) client engine.
//!
//! Talks JSON-RPC 2.0 to an agent subprocess over stdin/stdout. Layers,
//! bottom up: `codec` frames bytes into messages, `transport` owns the
//! process, `rpc` correlates calls with responses, `session` runs the
//! handshake and prompt turns, and `engine` restarts sessions on the next
//! model candidate when one runs out of quota.

pub mod codec;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod message;
pub mod rpc;
pub mod session;
pub mod streaming;
pub mod tools;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
