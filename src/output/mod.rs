//! User-facing terminal output and diagnostic log setup.

pub mod formatter;
pub mod logger;
