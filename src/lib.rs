//! acprun library: re-exports internal modules for the binary and for
//! integration testing.
//!
//! Integration tests in `tests/` cannot access items from a binary crate,
//! so everything lives behind this library target and `main.rs` only
//! parses arguments and picks the exit code.

pub mod acp;
pub mod cli;
pub mod config;
pub mod interrupt;
pub mod output;
pub mod project;
pub mod run_loop;
pub mod session_store;
