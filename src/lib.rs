//! Polymorphic function tracing with a per-function cache of concrete functions.

pub mod cli;
pub mod config;
pub mod runtime;

pub use config::JitConfig;
