//! Backup/verify/revert protocol for the protected file.
//!
//! A mutation is accepted only if the rewritten file passes the compile check
//! and the smoke test. Any failure after the backup restores the original bytes.
//! The backup is never deleted.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::core::mutation::{CheckStage, MutationStage, backup_file_name, expand_check_command};
use crate::core::result::{CommandCapture, ErrorKind, MutationReport, Outcome};
use crate::io::config::ProtectedConfig;
use crate::io::paths::same_file;
use crate::io::process::{CommandRequest, CommandRunner, CommandSpec, panic_detail};

const MAX_BACKUP_SUFFIX: u32 = 1_000;

/// Guard for the single protected file.
pub struct MutationGuard<'a, R: CommandRunner> {
    root: &'a Path,
    protected: &'a ProtectedConfig,
    runner: &'a R,
    timeout: Duration,
    output_limit_bytes: usize,
}

/// Ephemeral record of one attempt; dropped once its result is produced.
///
/// Dropping an attempt that was never settled while the file may hold the
/// proposed bytes (unwinding out of a check, for instance) restores the
/// original.
struct MutationAttempt<'p> {
    protected_path: PathBuf,
    original: Vec<u8>,
    proposed: &'p str,
    backup_path: Option<PathBuf>,
    stage: MutationStage,
    compile_result: Option<CommandCapture>,
    smoke_result: Option<CommandCapture>,
    settled: bool,
}

impl<'p> MutationAttempt<'p> {
    fn new(protected_path: PathBuf, proposed: &'p str) -> Self {
        Self {
            protected_path,
            original: Vec::new(),
            proposed,
            backup_path: None,
            stage: MutationStage::Start,
            compile_result: None,
            smoke_result: None,
            settled: false,
        }
    }

    fn advance(&mut self) {
        if let Some(next) = self.stage.next() {
            debug!(from = ?self.stage, to = ?next, "mutation stage");
            self.stage = next;
        }
    }

    fn report(&mut self, failed_check: Option<CheckStage>) -> MutationReport {
        self.settled = true;
        MutationReport {
            reached: self.stage,
            stage: failed_check,
            backup_path: self
                .backup_path
                .as_ref()
                .map(|path| path.display().to_string()),
            compile_result: self.compile_result.take(),
            smoke_result: self.smoke_result.take(),
        }
    }

    fn block(mut self, reason: String) -> (Outcome, MutationReport) {
        debug_assert!(self.stage.can_block());
        warn!(reason = %reason, "mutation blocked");
        (Outcome::blocked(reason), self.report(None))
    }

    /// Error before anything was written; the protected file is untouched.
    fn abort(mut self, reason: String) -> (Outcome, MutationReport) {
        warn!(stage = ?self.stage, reason = %reason, "mutation aborted");
        (Outcome::failed(ErrorKind::Execution, reason), self.report(None))
    }

    /// Restore the snapshot and report which check failed.
    fn revert(mut self, check: CheckStage, kind: ErrorKind, reason: String) -> (Outcome, MutationReport) {
        debug_assert!(self.stage.can_revert());
        self.settled = true;
        let backup = self
            .backup_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        if let Err(err) = fs::write(&self.protected_path, &self.original) {
            warn!(err = %err, backup = %backup, "restoring protected file failed");
            let message = format!(
                "{reason}; restoring {} failed: {err}; original content preserved at {backup}",
                self.protected_path.display()
            );
            return (
                Outcome::failed(ErrorKind::Mutation, message),
                self.report(Some(check)),
            );
        }
        info!(check = check.label(), backup = %backup, "protected file restored");
        (
            Outcome::reverted(kind, format!("{reason}; original restored")),
            self.report(Some(check)),
        )
    }
}

impl Drop for MutationAttempt<'_> {
    fn drop(&mut self) {
        if self.settled || !self.stage.can_revert() {
            return;
        }
        warn!(stage = ?self.stage, "mutation interrupted; restoring protected file");
        if let Err(err) = fs::write(&self.protected_path, &self.original) {
            error!(
                err = %err,
                backup = ?self.backup_path,
                "restoring protected file after interruption failed"
            );
        }
    }
}

impl<'a, R: CommandRunner> MutationGuard<'a, R> {
    pub fn new(
        root: &'a Path,
        protected: &'a ProtectedConfig,
        runner: &'a R,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            root,
            protected,
            runner,
            timeout,
            output_limit_bytes,
        }
    }

    /// Path of the protected file under the project root.
    pub fn protected_path(&self) -> PathBuf {
        self.root.join(&self.protected.path)
    }

    /// Run the full protocol for one proposed rewrite.
    #[instrument(skip_all, fields(requested = requested, protected = %self.protected.path))]
    pub fn apply(&self, requested: &str, proposed: &str) -> (Outcome, MutationReport) {
        self.apply_at(requested, proposed, Utc::now())
    }

    fn apply_at(
        &self,
        requested: &str,
        proposed: &str,
        now: DateTime<Utc>,
    ) -> (Outcome, MutationReport) {
        let protected_path = self.protected_path();
        let mut attempt = MutationAttempt::new(protected_path.clone(), proposed);

        if !same_file(&self.root.join(requested), &protected_path) {
            return attempt.block(format!(
                "modify_engine only applies to {}; refusing to modify {requested}",
                self.protected.path
            ));
        }
        if !protected_path.is_file() {
            return attempt.block(format!(
                "{} not found; nothing to modify",
                self.protected.path
            ));
        }
        attempt.advance();

        attempt.original = match fs::read(&protected_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                return attempt.abort(format!("read {}: {err}", self.protected.path));
            }
        };
        match write_backup(&protected_path, &attempt.original, now) {
            Ok(path) => {
                info!(backup = %path.display(), "protected file backed up");
                attempt.backup_path = Some(path);
            }
            Err(err) => return attempt.abort(format!("{err:#}")),
        }
        attempt.advance();

        if let Err(err) = fs::write(&protected_path, attempt.proposed) {
            let reason = format!("write {}: {err}", self.protected.path);
            return attempt.revert(CheckStage::Write, ErrorKind::Execution, reason);
        }
        attempt.advance();

        let compile = self.run_check(&self.protected.compile_command);
        let compile_passed = compile.success();
        let compile_timed_out = compile.timed_out;
        attempt.compile_result = Some(compile);
        if !compile_passed {
            return attempt.revert(
                CheckStage::Compile,
                check_failure_kind(compile_timed_out),
                check_failure_reason(CheckStage::Compile, &self.protected.path, compile_timed_out),
            );
        }
        attempt.advance();

        let smoke = self.run_check(&self.protected.smoke_command);
        let smoke_passed = smoke.success();
        let smoke_timed_out = smoke.timed_out;
        attempt.smoke_result = Some(smoke);
        if !smoke_passed {
            return attempt.revert(
                CheckStage::SmokeTest,
                check_failure_kind(smoke_timed_out),
                check_failure_reason(CheckStage::SmokeTest, &self.protected.path, smoke_timed_out),
            );
        }
        // SmokeTested, then Committed: nothing left to do on disk.
        attempt.advance();
        attempt.advance();

        info!("protected file mutation committed");
        (Outcome::ok(), attempt.report(None))
    }

    fn run_check(&self, template: &[String]) -> CommandCapture {
        let request = CommandRequest {
            spec: CommandSpec::Argv(expand_check_command(template, &self.protected.path)),
            workdir: self.root.to_path_buf(),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| self.runner.run(&request))) {
            Ok(Ok(capture)) => capture,
            Ok(Err(err)) => {
                warn!(err = %err, command = %request.spec.display(), "check command did not run");
                CommandCapture::not_started(format!("{err:#}"))
            }
            Err(payload) => {
                let detail = panic_detail(payload.as_ref());
                error!(detail = %detail, command = %request.spec.display(), "check runner panicked");
                CommandCapture::not_started(format!("check runner panicked: {detail}"))
            }
        }
    }
}

fn check_failure_kind(timed_out: bool) -> ErrorKind {
    if timed_out {
        ErrorKind::Timeout
    } else {
        ErrorKind::Mutation
    }
}

fn check_failure_reason(check: CheckStage, protected: &str, timed_out: bool) -> String {
    if timed_out {
        format!("{} of {protected} timed out", check.label())
    } else {
        format!("{} of {protected} failed", check.label())
    }
}

/// Copy `contents` to a fresh backup file beside `protected`.
///
/// The name is claimed with create-new semantics, so concurrent or same-second
/// attempts get distinct files.
pub fn write_backup(protected: &Path, contents: &[u8], now: DateTime<Utc>) -> Result<PathBuf> {
    let parent = protected
        .parent()
        .with_context(|| format!("protected path missing parent {}", protected.display()))?;
    let stem = protected
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .with_context(|| format!("protected path missing file name {}", protected.display()))?;
    let extension = protected
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned());
    let timestamp = now.format("%Y%m%d_%H%M%S").to_string();

    for suffix in 0..MAX_BACKUP_SUFFIX {
        let path = parent.join(backup_file_name(
            &stem,
            extension.as_deref(),
            &timestamp,
            suffix,
        ));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(contents)
                    .with_context(|| format!("write backup {}", path.display()))?;
                file.sync_all()
                    .with_context(|| format!("sync backup {}", path.display()))?;
                return Ok(path);
            }
            Err(err) if err.kind() == IoErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("create backup {}", path.display()));
            }
        }
    }
    Err(anyhow!(
        "no free backup name for {} at {timestamp}",
        protected.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::result::Status;
    use crate::test_support::{ScriptedRunner, TestProject};
    use chrono::TimeZone;

    fn guard_parts(project: &TestProject) -> ProtectedConfig {
        project.config().sandbox.protected
    }

    #[test]
    fn compile_failure_restores_original() {
        let project = TestProject::new().expect("project");
        project.write_protected("def f(): return 1\n").expect("seed");
        let protected = guard_parts(&project);
        let runner = ScriptedRunner::new(vec![ScriptedRunner::exit(1, "", "SyntaxError")]);
        let guard = MutationGuard::new(project.root(), &protected, &runner, Duration::from_secs(5), 1_000);

        let (outcome, report) = guard.apply("engine/backtest.py", "def f() return 1\n");

        assert_eq!(outcome.status, Status::Reverted);
        assert_eq!(outcome.kind, Some(ErrorKind::Mutation));
        assert_eq!(report.stage, Some(CheckStage::Compile));
        assert_eq!(report.reached, MutationStage::Written);
        assert_eq!(project.read_protected().expect("read"), "def f(): return 1\n");
        let backup = PathBuf::from(report.backup_path.expect("backup"));
        assert_eq!(fs::read_to_string(backup).expect("backup"), "def f(): return 1\n");
        assert_eq!(runner.calls().len(), 1, "smoke test must not run");
    }

    #[test]
    fn smoke_failure_restores_original() {
        let project = TestProject::new().expect("project");
        project.write_protected("print('v1')\n").expect("seed");
        let protected = guard_parts(&project);
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::exit(0, "", ""),
            ScriptedRunner::exit(2, "", "Traceback"),
        ]);
        let guard = MutationGuard::new(project.root(), &protected, &runner, Duration::from_secs(5), 1_000);

        let (outcome, report) = guard.apply("engine/backtest.py", "raise SystemExit(2)\n");

        assert_eq!(outcome.status, Status::Reverted);
        assert_eq!(report.stage, Some(CheckStage::SmokeTest));
        assert_eq!(report.reached, MutationStage::CompileChecked);
        assert_eq!(project.read_protected().expect("read"), "print('v1')\n");
        assert_eq!(report.smoke_result.expect("smoke").stderr, "Traceback");
    }

    #[test]
    fn passing_checks_commit_proposed_content() {
        let project = TestProject::new().expect("project");
        project.write_protected("print('v1')\n").expect("seed");
        let protected = guard_parts(&project);
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::exit(0, "", ""),
            ScriptedRunner::exit(0, "total_return: 0.1", ""),
        ]);
        let guard = MutationGuard::new(project.root(), &protected, &runner, Duration::from_secs(5), 1_000);

        let (outcome, report) = guard.apply("engine/backtest.py", "print('v2')\n");

        assert_eq!(outcome, Outcome::ok());
        assert_eq!(report.reached, MutationStage::Committed);
        assert_eq!(project.read_protected().expect("read"), "print('v2')\n");
        assert!(report.compile_result.is_some());
        assert!(report.smoke_result.is_some());
        assert!(PathBuf::from(report.backup_path.expect("backup")).is_file());

        let calls = runner.calls();
        assert_eq!(
            calls[0].spec,
            CommandSpec::Argv(vec![
                "python".to_string(),
                "-m".to_string(),
                "py_compile".to_string(),
                "engine/backtest.py".to_string(),
            ])
        );
        assert_eq!(calls[0].workdir, project.root());
    }

    #[test]
    fn other_targets_are_blocked_without_side_effects() {
        let project = TestProject::new().expect("project");
        project.write_protected("print('v1')\n").expect("seed");
        let protected = guard_parts(&project);
        let runner = ScriptedRunner::new(Vec::new());
        let guard = MutationGuard::new(project.root(), &protected, &runner, Duration::from_secs(5), 1_000);

        let (outcome, report) = guard.apply("engine/metrics.py", "x = 1\n");

        assert_eq!(outcome.status, Status::Blocked);
        assert_eq!(outcome.kind, Some(ErrorKind::Policy));
        assert_eq!(report.reached, MutationStage::Start);
        assert!(report.backup_path.is_none());
        assert!(!project.root().join("engine/metrics.py").exists());
        assert_eq!(project.backups().expect("backups").len(), 0);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn equivalent_spellings_of_the_target_are_accepted() {
        let project = TestProject::new().expect("project");
        project.write_protected("print('v1')\n").expect("seed");
        let protected = guard_parts(&project);
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::exit(0, "", ""),
            ScriptedRunner::exit(0, "", ""),
        ]);
        let guard = MutationGuard::new(project.root(), &protected, &runner, Duration::from_secs(5), 1_000);

        let (outcome, _) = guard.apply("strategies/../engine/./backtest.py", "print('v2')\n");
        assert_eq!(outcome.status, Status::Ok);
    }

    #[test]
    fn missing_protected_file_is_blocked() {
        let project = TestProject::new().expect("project");
        let protected = guard_parts(&project);
        let runner = ScriptedRunner::new(Vec::new());
        let guard = MutationGuard::new(project.root(), &protected, &runner, Duration::from_secs(5), 1_000);

        let (outcome, _) = guard.apply("engine/backtest.py", "print('v2')\n");
        assert_eq!(outcome.status, Status::Blocked);
        assert!(!guard.protected_path().exists());
    }

    #[test]
    fn check_timeout_reverts_with_timeout_kind() {
        let project = TestProject::new().expect("project");
        project.write_protected("print('v1')\n").expect("seed");
        let protected = guard_parts(&project);
        let runner = ScriptedRunner::new(vec![ScriptedRunner::timeout()]);
        let guard = MutationGuard::new(project.root(), &protected, &runner, Duration::from_secs(5), 1_000);

        let (outcome, report) = guard.apply("engine/backtest.py", "while True: pass\n");
        assert_eq!(outcome.status, Status::Reverted);
        assert_eq!(outcome.kind, Some(ErrorKind::Timeout));
        assert_eq!(report.stage, Some(CheckStage::Compile));
        assert_eq!(project.read_protected().expect("read"), "print('v1')\n");
    }

    #[test]
    fn check_that_cannot_spawn_reverts() {
        let project = TestProject::new().expect("project");
        project.write_protected("print('v1')\n").expect("seed");
        let protected = guard_parts(&project);
        let runner = ScriptedRunner::new(vec![ScriptedRunner::spawn_error("python not found")]);
        let guard = MutationGuard::new(project.root(), &protected, &runner, Duration::from_secs(5), 1_000);

        let (outcome, report) = guard.apply("engine/backtest.py", "print('v2')\n");
        assert_eq!(outcome.status, Status::Reverted);
        let compile = report.compile_result.expect("compile");
        assert_eq!(compile.returncode, None);
        assert!(compile.stderr.contains("python not found"));
        assert_eq!(project.read_protected().expect("read"), "print('v1')\n");
    }

    struct PanickingRunner;

    impl CommandRunner for PanickingRunner {
        fn run(&self, _request: &CommandRequest) -> Result<CommandCapture> {
            panic!("compiler crashed");
        }
    }

    #[test]
    fn panicking_check_reverts_like_a_failed_check() {
        let project = TestProject::new().expect("project");
        project.write_protected("print('v1')\n").expect("seed");
        let protected = guard_parts(&project);
        let guard = MutationGuard::new(
            project.root(),
            &protected,
            &PanickingRunner,
            Duration::from_secs(5),
            1_000,
        );

        let (outcome, report) = guard.apply("engine/backtest.py", "print('v2')\n");

        assert_eq!(outcome.status, Status::Reverted);
        assert_eq!(report.stage, Some(CheckStage::Compile));
        assert_eq!(report.reached, MutationStage::Written);
        assert!(
            report
                .compile_result
                .expect("compile")
                .stderr
                .contains("compiler crashed")
        );
        assert_eq!(project.read_protected().expect("read"), "print('v1')\n");
    }

    #[test]
    fn unsettled_attempt_restores_original_when_dropped() {
        let project = TestProject::new().expect("project");
        project.write_protected("print('v1')\n").expect("seed");
        let protected_path = project.root().join("engine/backtest.py");

        let result = panic::catch_unwind(|| {
            let mut attempt = MutationAttempt::new(protected_path.clone(), "print('v2')\n");
            attempt.original = b"print('v1')\n".to_vec();
            attempt.stage = MutationStage::Written;
            fs::write(&protected_path, attempt.proposed).expect("write proposed");
            panic!("interrupted mid-check");
        });

        assert!(result.is_err());
        assert_eq!(project.read_protected().expect("read"), "print('v1')\n");
    }

    #[test]
    fn settled_attempts_leave_the_file_alone_when_dropped() {
        let project = TestProject::new().expect("project");
        project.write_protected("print('v2')\n").expect("seed");

        let mut attempt = MutationAttempt::new(project.root().join("engine/backtest.py"), "print('v2')\n");
        attempt.original = b"print('v1')\n".to_vec();
        attempt.stage = MutationStage::Committed;
        drop(attempt);

        assert_eq!(project.read_protected().expect("read"), "print('v2')\n");
    }

    #[test]
    fn same_second_backups_get_distinct_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let protected = temp.path().join("backtest.py");
        fs::write(&protected, "v1").expect("seed");
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        let first = write_backup(&protected, b"v1", now).expect("first");
        let second = write_backup(&protected, b"v2", now).expect("second");

        assert_eq!(
            first.file_name().unwrap().to_string_lossy(),
            "backtest_backup_20240102_030405.py"
        );
        assert_eq!(
            second.file_name().unwrap().to_string_lossy(),
            "backtest_backup_20240102_030405_1.py"
        );
        assert_eq!(fs::read(&first).expect("first"), b"v1");
        assert_eq!(fs::read(&second).expect("second"), b"v2");
    }

    #[test]
    fn backups_persist_across_attempts() {
        let project = TestProject::new().expect("project");
        project.write_protected("print('v1')\n").expect("seed");
        let protected = guard_parts(&project);
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::exit(1, "", ""),
            ScriptedRunner::exit(1, "", ""),
        ]);
        let guard = MutationGuard::new(project.root(), &protected, &runner, Duration::from_secs(5), 1_000);
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        guard.apply_at("engine/backtest.py", "bad", now);
        guard.apply_at("engine/backtest.py", "bad", now);

        assert_eq!(project.backups().expect("backups").len(), 2);
    }
}
