//! Multi-step conversation loop for `driver run`.
//!
//! Each step sends the conversation to the agent, executes the returned batch,
//! logs the step, and feeds the results back as the next user message.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument};

use crate::batch::{BatchExecutor, BatchSummary};
use crate::io::agent::{Agent, Message};
use crate::io::config::DriverConfig;
use crate::io::process::CommandRunner;
use crate::io::prompt::{followup_message, initial_message, load_system_prompt};
use crate::io::step_log::{StepLog, StepRecord};

/// Reason why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationStop {
    /// The agent replied with an empty action list.
    NoActions,
    /// Every allowed step ran.
    MaxSteps { max_steps: u32 },
}

/// Summary of one executed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: u32,
    pub actions: usize,
    pub summary: BatchSummary,
    pub log_path: PathBuf,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationOutcome {
    pub steps_executed: u32,
    pub log_dir: PathBuf,
    pub stop: ConversationStop,
}

/// Owns the conversation history and drives agent and sandbox.
pub struct ConversationController<A: Agent, R: CommandRunner> {
    agent: A,
    batch: BatchExecutor<R>,
    log_dir: PathBuf,
    max_steps: u32,
    messages: Vec<Message>,
    pending: String,
}

impl<A: Agent, R: CommandRunner> ConversationController<A, R> {
    /// Load the system prompt and the first user message.
    pub fn new(root: &Path, config: &DriverConfig, agent: A, batch: BatchExecutor<R>) -> Result<Self> {
        let system = load_system_prompt(root, &config.agent)?;
        let pending = initial_message(root, config)?;
        Ok(Self {
            agent,
            batch,
            log_dir: root.join(&config.agent.log_dir),
            max_steps: config.agent.max_steps,
            messages: vec![Message::system(system)],
            pending,
        })
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// Run until the agent has nothing left to do or the step limit is hit.
    ///
    /// Agent failures, malformed replies and step-log write failures stop the
    /// loop with an error. Action failures do not; they are reported back to the
    /// agent as results.
    #[instrument(skip_all, fields(max_steps = self.max_steps))]
    pub fn run<F: FnMut(&StepOutcome)>(&mut self, mut on_step: F) -> Result<ConversationOutcome> {
        let log = StepLog::create(&self.log_dir, Utc::now())?;
        let mut steps_executed = 0u32;

        for step in 1..=self.max_steps {
            self.messages.push(Message::user(self.pending.clone()));

            let started_at = Utc::now();
            let clock = Instant::now();
            let actions = self
                .agent
                .next_actions(&self.messages)
                .with_context(|| format!("agent reply for step {step}"))?;
            info!(step, actions = actions.len(), "agent replied");
            if actions.is_empty() {
                return Ok(ConversationOutcome {
                    steps_executed,
                    log_dir: log.dir().to_path_buf(),
                    stop: ConversationStop::NoActions,
                });
            }

            let results = self.batch.execute_values(&actions);
            let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
            let log_path = log.write(&StepRecord {
                step,
                started_at: started_at.to_rfc3339(),
                duration_ms,
                actions: &actions,
                results: &results,
            })?;

            let assistant = serde_json::to_string(&json!({
                "actions": actions,
                "results": results,
            }))
            .context("serialize assistant turn")?;
            self.messages.push(Message::assistant(assistant));
            self.pending = followup_message(&results)?;

            steps_executed += 1;
            on_step(&StepOutcome {
                step,
                actions: actions.len(),
                summary: BatchSummary::from_results(&results),
                log_path,
            });
        }

        Ok(ConversationOutcome {
            steps_executed,
            log_dir: log.dir().to_path_buf(),
            stop: ConversationStop::MaxSteps {
                max_steps: self.max_steps,
            },
        })
    }
}
