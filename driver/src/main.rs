//! Action-execution sandbox CLI.
//!
//! Runs agent-proposed action batches against a strategy-lab project under the
//! policy in `.driver/config.toml`, either one batch at a time (`exec`) or as a
//! conversation loop against an agent command (`run`).

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use driver::batch::{BatchExecutor, BatchSummary};
use driver::conversation::{ConversationController, ConversationStop};
use driver::exit_codes;
use driver::io::agent::CommandAgent;
use driver::io::config::{CONFIG_RELATIVE_PATH, DriverConfig, load_config, write_config};
use driver::io::dispatcher::ActionDispatcher;
use driver::io::process::ProcessRunner;
use driver::logging;

#[derive(Parser)]
#[command(
    name = "driver",
    version,
    about = "Sandboxed executor for agent-proposed file and command actions"
)]
struct Cli {
    /// Project root that actions resolve against.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Config file (defaults to `<root>/.driver/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.driver/config.toml` with default policy.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Execute one action batch read from FILE (or stdin) and print the results.
    Exec {
        /// JSON file holding `[...]` or `{"actions": [...]}`.
        file: Option<PathBuf>,
    },
    /// Report whether the whitelist allows COMMAND (exit 0 allowed, 2 blocked).
    Check {
        command: String,
    },
    /// Run the conversation loop against the configured agent command.
    Run {
        /// Override `agent.max_steps`.
        #[arg(long)]
        max_steps: Option<u32>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.root.join(CONFIG_RELATIVE_PATH));
    match cli.command {
        Command::Init { force } => cmd_init(&config_path, force),
        Command::Exec { file } => cmd_exec(&cli.root, &config_path, file.as_deref()),
        Command::Check { command } => cmd_check(&config_path, &command),
        Command::Run { max_steps } => cmd_run(&cli.root, &config_path, max_steps),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &DriverConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_exec(root: &Path, config_path: &Path, file: Option<&Path>) -> Result<i32> {
    let config = load_config(config_path)?;
    let input = match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read actions from stdin")?;
            buf
        }
    };
    let actions = parse_action_list(&input)?;

    let batch = BatchExecutor::new(ActionDispatcher::new(root, config.sandbox, ProcessRunner));
    let results = batch.execute_values(&actions);
    println!(
        "{}",
        serde_json::to_string_pretty(&results).context("serialize results")?
    );
    Ok(exit_codes::OK)
}

fn cmd_check(config_path: &Path, command: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let whitelist = config.sandbox.whitelist();
    match whitelist.matching_prefix(command) {
        Some(prefix) => {
            println!("allowed (prefix: {prefix})");
            Ok(exit_codes::OK)
        }
        None => {
            println!("{}", whitelist.blocked_message(command));
            Ok(exit_codes::BLOCKED)
        }
    }
}

fn cmd_run(root: &Path, config_path: &Path, max_steps: Option<u32>) -> Result<i32> {
    let mut config = load_config(config_path)?;
    if let Some(max_steps) = max_steps {
        if max_steps == 0 {
            bail!("--max-steps must be > 0");
        }
        config.agent.max_steps = max_steps;
    }

    let agent = CommandAgent::new(&config.agent, root);
    let batch = BatchExecutor::new(ActionDispatcher::new(
        root,
        config.sandbox.clone(),
        ProcessRunner,
    ));
    let mut controller = ConversationController::new(root, &config, agent, batch)?;
    let outcome = controller.run(|step| {
        println!(
            "step {}: {} actions ({})",
            step.step,
            step.actions,
            describe(&step.summary)
        );
    })?;

    match outcome.stop {
        ConversationStop::NoActions => println!(
            "agent finished after {} steps; logs in {}",
            outcome.steps_executed,
            outcome.log_dir.display()
        ),
        ConversationStop::MaxSteps { max_steps } => println!(
            "stopped at the {max_steps}-step limit; logs in {}",
            outcome.log_dir.display()
        ),
    }
    Ok(exit_codes::OK)
}

fn describe(summary: &BatchSummary) -> String {
    format!(
        "ok={} error={} blocked={} reverted={}",
        summary.ok, summary.error, summary.blocked, summary.reverted
    )
}

/// Accept either a bare array of actions or an `{"actions": [...]}` object.
fn parse_action_list(input: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(input).context("parse actions json")?;
    match value {
        Value::Array(actions) => Ok(actions),
        Value::Object(mut map) => match map.remove("actions") {
            Some(Value::Array(actions)) => Ok(actions),
            _ => Err(anyhow!("expected an `actions` array")),
        },
        _ => Err(anyhow!("expected a JSON array or an object with `actions`")),
    }
}
