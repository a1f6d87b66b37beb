//! Step records for a conversation run.
//!
//! Each run gets its own directory under the configured log dir,
//! `run-<YYYYMMDD_HHMMSS>[_<n>]/`, holding one `agent_step_<n>.json` per
//! executed step. Records are never overwritten.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::core::result::ActionResult;

const MAX_RUN_SUFFIX: u32 = 1_000;

/// Audit record for one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord<'a> {
    pub step: u32,
    pub started_at: String,
    pub duration_ms: u64,
    pub actions: &'a [Value],
    pub results: &'a [ActionResult],
}

/// Append-only log directory for one run.
#[derive(Debug, Clone)]
pub struct StepLog {
    dir: PathBuf,
}

impl StepLog {
    /// Claim a fresh run directory under `log_dir`.
    pub fn create(log_dir: &Path, now: DateTime<Utc>) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("create log dir {}", log_dir.display()))?;
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        for suffix in 0..MAX_RUN_SUFFIX {
            let name = if suffix == 0 {
                format!("run-{stamp}")
            } else {
                format!("run-{stamp}_{suffix}")
            };
            let dir = log_dir.join(name);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "created run log dir");
                    return Ok(Self { dir });
                }
                Err(err) if err.kind() == IoErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("create run dir {}", dir.display()));
                }
            }
        }
        Err(anyhow!(
            "no free run directory in {} for {stamp}",
            log_dir.display()
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn step_path(&self, step: u32) -> PathBuf {
        self.dir.join(format!("agent_step_{step}.json"))
    }

    /// Write `record` as pretty JSON. Fails if the step was already logged.
    pub fn write(&self, record: &StepRecord<'_>) -> Result<PathBuf> {
        let path = self.step_path(record.step);
        let mut buf = serde_json::to_string_pretty(record).context("serialize step record")?;
        buf.push('\n');
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create step log {}", path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("write step log {}", path.display()))?;
        Ok(path)
    }
}
