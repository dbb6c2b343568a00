//! Deterministic, pure logic shared by the orchestration layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod budget;
pub mod errors;
pub mod events;
pub mod schedule;
pub mod transitions;
pub mod types;
