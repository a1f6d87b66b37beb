//! Ordered execution of an action batch.

use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument};

use crate::core::action::Action;
use crate::core::result::{ActionResult, Status};
use crate::io::dispatcher::{ActionDispatcher, handler_failure};
use crate::io::process::{CommandRunner, panic_detail};

/// Per-status counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub ok: usize,
    pub error: usize,
    pub blocked: usize,
    pub reverted: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[ActionResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result.status() {
                Status::Ok => summary.ok += 1,
                Status::Error => summary.error += 1,
                Status::Blocked => summary.blocked += 1,
                Status::Reverted => summary.reverted += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.ok + self.error + self.blocked + self.reverted
    }
}

/// Runs actions strictly left to right, one result per action.
pub struct BatchExecutor<R: CommandRunner> {
    dispatcher: ActionDispatcher<R>,
}

impl<R: CommandRunner> BatchExecutor<R> {
    pub fn new(dispatcher: ActionDispatcher<R>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &ActionDispatcher<R> {
        &self.dispatcher
    }

    /// Parse and execute raw action objects.
    pub fn execute_values(&self, raw: &[Value]) -> Vec<ActionResult> {
        let actions: Vec<Action> = raw.iter().map(Action::from_value).collect();
        self.execute(&actions)
    }

    #[instrument(skip_all, fields(actions = actions.len()))]
    pub fn execute(&self, actions: &[Action]) -> Vec<ActionResult> {
        let results: Vec<ActionResult> = actions
            .iter()
            .enumerate()
            .map(|(index, action)| self.execute_one(index, action))
            .collect();
        let summary = BatchSummary::from_results(&results);
        info!(
            ok = summary.ok,
            error = summary.error,
            blocked = summary.blocked,
            reverted = summary.reverted,
            "batch finished"
        );
        results
    }

    fn execute_one(&self, index: usize, action: &Action) -> ActionResult {
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatcher.dispatch(action))) {
            Ok(result) => result,
            Err(payload) => {
                let detail = panic_detail(payload.as_ref());
                error!(index, action = action.type_label(), detail = %detail, "action handler panicked");
                handler_failure(action, format!("action handler panicked: {detail}"))
            }
        }
    }
}
