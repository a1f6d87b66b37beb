//! Deterministic, pure logic shared by the sandbox.
//!
//! Core modules must be free of I/O side effects. They define the action and
//! result model, the whitelist gate, path comparisons, and the mutation state
//! machine, and return deterministic outputs suitable for tests.

pub mod action;
pub mod containment;
pub mod mutation;
pub mod result;
pub mod whitelist;
