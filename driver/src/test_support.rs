//! Test-only helpers: a throwaway strategy-lab project and scripted fakes for
//! the process and agent seams.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::result::CommandCapture;
use crate::io::agent::{Agent, Message};
use crate::io::config::DriverConfig;
use crate::io::process::{CommandRequest, CommandRunner};

/// Temporary project root laid out like a strategy lab.
pub struct TestProject {
    _temp: TempDir,
    root: PathBuf,
}

impl TestProject {
    /// Create `engine/`, `strategies/` and `logs/` under a fresh temp dir.
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = fs::canonicalize(temp.path()).context("canonicalize tempdir")?;
        for dir in ["engine", "strategies", "logs"] {
            fs::create_dir_all(root.join(dir)).with_context(|| format!("create {dir}"))?;
        }
        Ok(Self { _temp: temp, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Default config with protected-file mutation enabled.
    pub fn config(&self) -> DriverConfig {
        let mut config = DriverConfig::default();
        config.sandbox.allow_modify_protected = true;
        config
    }

    pub fn write_file(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_file(&self, relative: &str) -> Result<String> {
        let path = self.root.join(relative);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn write_protected(&self, contents: &str) -> Result<()> {
        self.write_file(&self.config().sandbox.protected.path, contents)
    }

    pub fn read_protected(&self) -> Result<String> {
        self.read_file(&self.config().sandbox.protected.path)
    }

    /// Backup files beside the protected file, sorted by name.
    pub fn backups(&self) -> Result<Vec<PathBuf>> {
        let engine = self.root.join("engine");
        let mut backups = Vec::new();
        for entry in fs::read_dir(&engine).with_context(|| format!("list {}", engine.display()))? {
            let path = entry?.path();
            let is_backup = path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().contains("_backup_"));
            if is_backup {
                backups.push(path);
            }
        }
        backups.sort();
        Ok(backups)
    }
}

/// Command runner that replays predetermined captures in order.
pub struct ScriptedRunner {
    responses: RefCell<VecDeque<Result<CommandCapture>>>,
    calls: RefCell<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub fn new(responses: Vec<Result<CommandCapture>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn exit(code: i32, stdout: &str, stderr: &str) -> Result<CommandCapture> {
        Ok(CommandCapture {
            returncode: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            timed_out: false,
        })
    }

    pub fn timeout() -> Result<CommandCapture> {
        Ok(CommandCapture {
            returncode: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        })
    }

    pub fn spawn_error(message: &str) -> Result<CommandCapture> {
        Err(anyhow!("spawn failed: {message}"))
    }

    /// Requests received so far.
    pub fn calls(&self) -> Vec<CommandRequest> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandCapture> {
        self.calls.borrow_mut().push(request.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("scripted runner exhausted")))
    }
}

/// Agent that replays predetermined replies and records every conversation it saw.
pub struct ScriptedAgent {
    replies: RefCell<VecDeque<Result<Vec<Value>>>>,
    seen: RefCell<Vec<Vec<Message>>>,
}

impl ScriptedAgent {
    pub fn new(replies: Vec<Result<Vec<Value>>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            seen: RefCell::new(Vec::new()),
        }
    }

    /// Conversation snapshots passed to each call.
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.borrow().clone()
    }
}

impl Agent for ScriptedAgent {
    fn next_actions(&self, messages: &[Message]) -> Result<Vec<Value>> {
        self.seen.borrow_mut().push(messages.to_vec());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
