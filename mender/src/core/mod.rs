//! Deterministic, pure logic shared by the workflow engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod error;
pub mod error_log;
pub mod extract;
pub mod record;
pub mod state;
pub mod summary;
pub mod types;
pub mod verdict;
