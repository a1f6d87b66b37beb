//! Single-action dispatch.
//!
//! [`ActionDispatcher::dispatch`] type-switches an [`Action`] to its handler and
//! converts every failure into an [`ActionResult`]. Nothing escapes as an error.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::action::{Action, ActionType};
use crate::core::result::{ActionResult, ErrorKind, Outcome};
use crate::core::whitelist::{CommandWhitelist, WhitelistMode, tokenize};
use crate::io::config::{SandboxConfig, WritePolicy};
use crate::io::mutation::MutationGuard;
use crate::io::paths::{is_contained, same_file};
use crate::io::process::{CommandRequest, CommandRunner, CommandSpec};

/// Executes actions against a project root under a [`SandboxConfig`].
pub struct ActionDispatcher<R: CommandRunner> {
    root: PathBuf,
    config: SandboxConfig,
    whitelist: CommandWhitelist,
    runner: R,
}

impl<R: CommandRunner> ActionDispatcher<R> {
    pub fn new(root: impl Into<PathBuf>, config: SandboxConfig, runner: R) -> Self {
        let mut root = root.into();
        if let Ok(canonical) = fs::canonicalize(&root) {
            root = canonical;
        }
        let whitelist = config.whitelist();
        Self {
            root,
            config,
            whitelist,
            runner,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn whitelist(&self) -> &CommandWhitelist {
        &self.whitelist
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run one action and describe what happened.
    #[instrument(skip_all, fields(action = action.type_label()))]
    pub fn dispatch(&self, action: &Action) -> ActionResult {
        let result = match action {
            Action::ListDirectory { path } => self.list_dir(path),
            Action::ReadFile { path } => self.read_file(path),
            Action::WriteFile { path, content } => self.write_file(path, content),
            Action::ModifyProtectedFile { path, content } => self.modify_protected(path, content),
            Action::RunCommand { command } => self.run_command(command),
            Action::Malformed {
                action_type,
                reason,
                ..
            } => ActionResult::malformed(
                *action_type,
                action.target().map(str::to_string),
                reason.clone(),
            ),
            Action::Unknown { raw } => ActionResult::unknown(raw.clone()),
        };
        let outcome = result.outcome();
        match &outcome.error {
            Some(error) => info!(status = ?outcome.status, kind = ?outcome.kind, error = %error, "action finished"),
            None => info!(status = ?outcome.status, "action finished"),
        }
        result
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn list_dir(&self, path: &str) -> ActionResult {
        match sorted_entries(&self.resolve(path)) {
            Ok(items) => ActionResult::ListDir {
                path: Some(path.to_string()),
                items: Some(items),
                outcome: Outcome::ok(),
            },
            Err(err) => ActionResult::ListDir {
                path: Some(path.to_string()),
                items: None,
                outcome: Outcome::failed(ErrorKind::Execution, format!("{err:#}")),
            },
        }
    }

    fn read_file(&self, path: &str) -> ActionResult {
        let target = self.resolve(path);
        match fs::read_to_string(&target).with_context(|| format!("read {path}")) {
            Ok(content) => ActionResult::ReadFile {
                path: Some(path.to_string()),
                content: Some(content),
                outcome: Outcome::ok(),
            },
            Err(err) => ActionResult::ReadFile {
                path: Some(path.to_string()),
                content: None,
                outcome: Outcome::failed(ErrorKind::Execution, format!("{err:#}")),
            },
        }
    }

    fn write_file(&self, path: &str, content: &str) -> ActionResult {
        let target = self.resolve(path);
        let writable = self.is_writable(&target);
        if !writable {
            match self.config.write.policy {
                WritePolicy::Enforced => {
                    return ActionResult::WriteFile {
                        path: Some(path.to_string()),
                        outcome: Outcome::blocked(self.write_blocked_message(path, &target)),
                    };
                }
                WritePolicy::Advisory => {
                    warn!(path, "write outside writable locations (advisory policy)");
                }
            }
        }

        let outcome = match self.write_creating_parents(path, &target, content) {
            Ok(outcome) => outcome,
            Err(err) => Outcome::failed(ErrorKind::Execution, format!("{err:#}")),
        };
        ActionResult::WriteFile {
            path: Some(path.to_string()),
            outcome,
        }
    }

    /// Create missing parents, then re-check the real location before writing.
    /// The created directories may change what `target` resolves to.
    fn write_creating_parents(&self, path: &str, target: &Path, content: &str) -> Result<Outcome> {
        let (Some(parent), Some(name)) = (target.parent(), target.file_name()) else {
            return Ok(Outcome::failed(
                ErrorKind::Validation,
                format!("write to {path}: not a file path"),
            ));
        };
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let real_parent = fs::canonicalize(parent)
            .with_context(|| format!("resolve directory {}", parent.display()))?;
        let real_target = real_parent.join(name);
        if self.config.write.policy == WritePolicy::Enforced && !self.is_writable(&real_target) {
            warn!(path, real = %real_target.display(), "write target escaped after resolving parents");
            return Ok(Outcome::blocked(self.write_blocked_message(path, &real_target)));
        }
        fs::write(&real_target, content)
            .with_context(|| format!("write {}", real_target.display()))?;
        Ok(Outcome::ok())
    }

    fn is_writable(&self, target: &Path) -> bool {
        let write = &self.config.write;
        write
            .writable_dirs
            .iter()
            .any(|dir| is_contained(target, &self.root.join(dir)))
            || write
                .writable_files
                .iter()
                .any(|file| same_file(target, &self.root.join(file)))
    }

    fn write_blocked_message(&self, path: &str, target: &Path) -> String {
        let write = &self.config.write;
        let mut allowed: Vec<String> = write
            .writable_dirs
            .iter()
            .map(|dir| format!("{}/", dir.trim_end_matches('/')))
            .collect();
        allowed.extend(write.writable_files.iter().cloned());
        let mut message = format!(
            "write to {path} blocked: writable locations are {}",
            allowed.join(", ")
        );
        if same_file(target, &self.root.join(&self.config.protected.path)) {
            message.push_str(&format!(
                "; use modify_engine to change {}",
                self.config.protected.path
            ));
        }
        message
    }

    fn modify_protected(&self, path: &str, content: &str) -> ActionResult {
        if !self.config.allow_modify_protected {
            return ActionResult::ModifyEngine {
                path: Some(path.to_string()),
                report: None,
                outcome: Outcome::blocked(
                    "modifying the protected file is disabled (sandbox.allow_modify_protected = false)",
                ),
            };
        }
        let guard = MutationGuard::new(
            &self.root,
            &self.config.protected,
            &self.runner,
            self.config.command_timeout(),
            self.config.output_limit_bytes,
        );
        let (outcome, report) = guard.apply(path, content);
        ActionResult::ModifyEngine {
            path: Some(path.to_string()),
            report: Some(report),
            outcome,
        }
    }

    fn run_command(&self, command: &str) -> ActionResult {
        let blocked = |reason: String| ActionResult::RunCommand {
            command: Some(command.to_string()),
            capture: None,
            outcome: Outcome::blocked(reason),
        };
        if !self.config.allow_run_commands {
            return blocked(
                "command execution is disabled (sandbox.allow_run_commands = false)".to_string(),
            );
        }
        let Some(prefix) = self.whitelist.matching_prefix(command) else {
            return blocked(self.whitelist.blocked_message(command));
        };
        debug!(prefix, "command admitted by whitelist");

        let spec = match self.whitelist.mode() {
            WhitelistMode::Prefix => CommandSpec::Shell(command.to_string()),
            WhitelistMode::Tokens => match tokenize(command) {
                Some(argv) => CommandSpec::Argv(argv),
                None => return blocked(self.whitelist.blocked_message(command)),
            },
        };
        let request = CommandRequest {
            spec,
            workdir: self.root.clone(),
            timeout: self.config.command_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
        };

        match self.runner.run(&request) {
            Ok(capture) => {
                let outcome = if capture.success() {
                    Outcome::ok()
                } else if capture.timed_out {
                    Outcome::failed(
                        ErrorKind::Timeout,
                        format!(
                            "command timed out after {}s",
                            self.config.command_timeout_secs
                        ),
                    )
                } else {
                    let code = capture
                        .returncode
                        .map(|code| code.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    Outcome::failed(
                        ErrorKind::Execution,
                        format!("command exited with status {code}"),
                    )
                };
                ActionResult::RunCommand {
                    command: Some(command.to_string()),
                    capture: Some(capture),
                    outcome,
                }
            }
            Err(err) => ActionResult::RunCommand {
                command: Some(command.to_string()),
                capture: None,
                outcome: Outcome::failed(ErrorKind::Execution, format!("{err:#}")),
            },
        }
    }
}

/// Result for an action whose handler could not complete at all.
pub fn handler_failure(action: &Action, reason: impl Into<String>) -> ActionResult {
    let reason = reason.into();
    let action_type = match action {
        Action::ListDirectory { .. } => ActionType::ListDir,
        Action::ReadFile { .. } => ActionType::ReadFile,
        Action::WriteFile { .. } => ActionType::WriteFile,
        Action::ModifyProtectedFile { .. } => ActionType::ModifyEngine,
        Action::RunCommand { .. } => ActionType::RunCommand,
        Action::Malformed { action_type, .. } => *action_type,
        Action::Unknown { raw } => return ActionResult::unknown(raw.clone()),
    };
    ActionResult::failed(
        action_type,
        action.target().map(str::to_string),
        ErrorKind::Execution,
        reason,
    )
}

fn sorted_entries(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))?;
    let mut items = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        items.push(entry.file_name().to_string_lossy().into_owned());
    }
    items.sort();
    Ok(items)
}
