//! Driver configuration stored under `.driver/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::mutation::PROTECTED_PLACEHOLDER;
use crate::core::whitelist::{CommandWhitelist, WhitelistMode};

/// Default location of the config file relative to the project root.
pub const CONFIG_RELATIVE_PATH: &str = ".driver/config.toml";

/// Driver configuration (TOML).
///
/// Missing fields default to the strategy-lab policy: commands enabled behind
/// the whitelist, protected-file mutation disabled, writes enforced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    pub sandbox: SandboxConfig,
    pub agent: AgentConfig,
}

/// Capabilities and policy of the action sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Permit `run_command` actions (still gated by the whitelist).
    pub allow_run_commands: bool,

    /// Permit `modify_engine` actions against the protected file.
    pub allow_modify_protected: bool,

    /// Wall-clock budget for each spawned command, in seconds.
    pub command_timeout_secs: u64,

    /// Keep at most this many bytes of stdout and of stderr per command.
    pub output_limit_bytes: usize,

    pub whitelist: WhitelistConfig,
    pub write: WriteConfig,
    pub protected: ProtectedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WhitelistConfig {
    pub mode: WhitelistMode,
    pub prefixes: Vec<String>,
}

/// Whether `write_file` targets are checked against the writable set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// Writes go anywhere; the writable set is only communicated to the agent.
    Advisory,
    /// Writes outside `writable_dirs`/`writable_files` are blocked.
    #[default]
    Enforced,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WriteConfig {
    pub policy: WritePolicy,
    /// Subtrees (relative to the root) that accept any file.
    pub writable_dirs: Vec<String>,
    /// Individual files (relative to the root) that accept writes.
    pub writable_files: Vec<String>,
}

/// The single file guarded by the backup/verify/revert protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProtectedConfig {
    /// Path relative to the project root.
    pub path: String,
    /// Syntax check; `{protected}` is replaced with `path`.
    pub compile_command: Vec<String>,
    /// End-to-end exercise against a known fixture; `{protected}` is replaced with `path`.
    pub smoke_command: Vec<String>,
}

/// Conversation loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent process: receives the conversation as JSON on stdin, prints
    /// `{"actions": [...]}` on stdout.
    pub command: Vec<String>,
    /// Wall-clock budget for one agent reply, in seconds.
    pub timeout_secs: u64,
    /// Upper bound on conversation steps per run.
    pub max_steps: u32,
    /// System prompt, relative to the project root.
    pub system_prompt_path: String,
    /// Optional first user message; the built-in template is used when unset.
    pub initial_message_path: Option<String>,
    /// Directory for `agent_step_<n>.json` records, relative to the project root.
    pub log_dir: String,
    /// Truncate agent stdout beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allow_run_commands: true,
            allow_modify_protected: false,
            command_timeout_secs: 15 * 60,
            output_limit_bytes: 200_000,
            whitelist: WhitelistConfig::default(),
            write: WriteConfig::default(),
            protected: ProtectedConfig::default(),
        }
    }
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            mode: WhitelistMode::Prefix,
            prefixes: [
                "python engine/fetch_data.py",
                "python engine/backtest.py",
                "python engine/analyze_runs.py",
                "python engine/plot_strategy.py",
                "python engine/optimize_params.py",
                "pip install -r requirements.txt",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            policy: WritePolicy::Enforced,
            writable_dirs: vec!["strategies".to_string()],
            writable_files: [
                "ARCHITECTURE.md",
                "README.md",
                "requirements.txt",
                "engine/plot_strategy.py",
                "engine/analyze_runs.py",
                "logs/user_actions.md",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl Default for ProtectedConfig {
    fn default() -> Self {
        Self {
            path: "engine/backtest.py".to_string(),
            compile_command: vec![
                "python".to_string(),
                "-m".to_string(),
                "py_compile".to_string(),
                PROTECTED_PLACEHOLDER.to_string(),
            ],
            smoke_command: vec![
                "python".to_string(),
                PROTECTED_PLACEHOLDER.to_string(),
                "strategies/example_ma_crossover.py".to_string(),
            ],
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "-".to_string(),
            ],
            timeout_secs: 10 * 60,
            max_steps: 30,
            system_prompt_path: "PROMPT.md".to_string(),
            initial_message_path: None,
            log_dir: "logs".to_string(),
            output_limit_bytes: 1_000_000,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("sandbox.command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self
            .whitelist
            .prefixes
            .iter()
            .any(|prefix| prefix.trim().is_empty())
        {
            return Err(anyhow!("sandbox.whitelist.prefixes must not contain blank entries"));
        }
        if self.protected.path.trim().is_empty() {
            return Err(anyhow!("sandbox.protected.path must be non-empty"));
        }
        ensure_command("sandbox.protected.compile_command", &self.protected.compile_command)?;
        ensure_command("sandbox.protected.smoke_command", &self.protected.smoke_command)?;
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn whitelist(&self) -> CommandWhitelist {
        CommandWhitelist::new(self.whitelist.prefixes.iter().cloned(), self.whitelist.mode)
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_command("agent.command", &self.command)?;
        if self.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.max_steps == 0 {
            return Err(anyhow!("agent.max_steps must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.log_dir.trim().is_empty() {
            return Err(anyhow!("agent.log_dir must be non-empty"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        self.sandbox.validate()?;
        self.agent.validate()
    }
}

fn ensure_command(field: &str, command: &[String]) -> Result<()> {
    if command.is_empty() || command[0].trim().is_empty() {
        return Err(anyhow!("{field} must be a non-empty array"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DriverConfig::default()`.
pub fn load_config(path: &Path) -> Result<DriverConfig> {
    if !path.exists() {
        let cfg = DriverConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DriverConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DriverConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
