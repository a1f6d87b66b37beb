//! Side-effecting helpers: filesystem, processes, config, agent and logs.

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod mutation;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod step_log;
