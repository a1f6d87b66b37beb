//! Action-execution sandbox for an autonomous strategy-lab agent.
//!
//! An agent proposes batches of file and command actions; the sandbox runs
//! them against a project tree under containment policies and reports one
//! result per action. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (action parsing, result model,
//!   whitelist, path comparison, mutation state machine). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, processes, config,
//!   the dispatcher, the protected-file guard, agent, prompts, step logs).
//!
//! [`batch`] runs ordered batches through the dispatcher; [`conversation`]
//! drives the multi-step loop against an agent.

pub mod batch;
pub mod conversation;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
