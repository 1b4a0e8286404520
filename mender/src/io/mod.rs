//! Side effects: configuration, subprocesses, the sandbox and collaborator adapters.

pub mod analyzer;
pub mod config;
pub mod discover;
pub mod generator;
pub mod process;
pub mod prompt;
pub mod retry;
pub mod sandbox;
pub mod syntax;
pub mod telemetry;
pub mod test_runner;
