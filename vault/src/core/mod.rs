//! Deterministic, pure logic shared by the vault pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod analysis;
pub mod backoff;
pub mod identity;
pub mod lifecycle;
pub mod rules;
pub mod signals;
pub mod types;
