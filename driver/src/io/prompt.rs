//! User-message builder for the conversation loop.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::result::ActionResult;
use crate::io::config::{AgentConfig, DriverConfig};

const INITIAL_TEMPLATE: &str = include_str!("prompts/initial.md");
const FOLLOWUP_TEMPLATE: &str = include_str!("prompts/followup.md");

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("initial", INITIAL_TEMPLATE)
            .context("load initial template")?;
        env.add_template("followup", FOLLOWUP_TEMPLATE)
            .context("load followup template")?;
        Ok(Self { env })
    }

    fn render_initial(&self, config: &DriverConfig) -> Result<String> {
        let sandbox = &config.sandbox;
        let template = self.env.get_template("initial")?;
        let rendered = template.render(context! {
            writable_dirs => sandbox.write.writable_dirs.iter().map(|dir| dir.trim_end_matches('/')).collect::<Vec<_>>(),
            writable_files => &sandbox.write.writable_files,
            allow_run_commands => sandbox.allow_run_commands,
            prefixes => &sandbox.whitelist.prefixes,
            allow_modify_protected => sandbox.allow_modify_protected,
            protected => &sandbox.protected.path,
        })?;
        Ok(rendered)
    }

    fn render_followup(&self, results_json: &str) -> Result<String> {
        let template = self.env.get_template("followup")?;
        Ok(template.render(context! { results => results_json })?)
    }
}

/// Read the system prompt. A missing file is an error: the loop must not start
/// without one.
pub fn load_system_prompt(root: &Path, config: &AgentConfig) -> Result<String> {
    let path = root.join(&config.system_prompt_path);
    if !path.is_file() {
        return Err(anyhow!(
            "system prompt {} not found; create it before running the loop",
            path.display()
        ));
    }
    fs::read_to_string(&path).with_context(|| format!("read system prompt {}", path.display()))
}

/// First user message: the configured file if set, otherwise the built-in
/// template rendered against the sandbox policy.
pub fn initial_message(root: &Path, config: &DriverConfig) -> Result<String> {
    if let Some(relative) = &config.agent.initial_message_path {
        let path = root.join(relative);
        debug!(path = %path.display(), "using initial message file");
        return fs::read_to_string(&path)
            .with_context(|| format!("read initial message {}", path.display()));
    }
    PromptEngine::new()?.render_initial(config)
}

/// User message that feeds one batch's results back to the agent.
pub fn followup_message(results: &[ActionResult]) -> Result<String> {
    let results_json = serde_json::to_string(results).context("serialize results")?;
    PromptEngine::new()?.render_followup(&results_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::result::Outcome;

    #[test]
    fn initial_message_lists_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = DriverConfig::default();
        config.sandbox.allow_modify_protected = true;

        let message = initial_message(temp.path(), &config).expect("render");
        assert!(message.contains("files under strategies/"));
        assert!(message.contains("  - logs/user_actions.md"));
        assert!(message.contains("  - pip install -r requirements.txt"));
        assert!(message.contains("modify_engine"));
        assert!(message.contains("{\"actions\": [...]}"));
    }

    #[test]
    fn disabled_capabilities_are_announced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = DriverConfig::default();
        config.sandbox.allow_run_commands = false;

        let message = initial_message(temp.path(), &config).expect("render");
        assert!(message.contains("run_command is disabled"));
        assert!(message.contains("engine/backtest.py must not be changed"));
        assert!(!message.contains("python engine/fetch_data.py"));
    }

    #[test]
    fn initial_message_file_overrides_template() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("TASK.md"), "Only list the root.").expect("write");
        let mut config = DriverConfig::default();
        config.agent.initial_message_path = Some("TASK.md".to_string());

        let message = initial_message(temp.path(), &config).expect("read");
        assert_eq!(message, "Only list the root.");
    }

    #[test]
    fn missing_system_prompt_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_system_prompt(temp.path(), &AgentConfig::default()).unwrap_err();
        assert!(err.to_string().contains("PROMPT.md"));

        fs::write(temp.path().join("PROMPT.md"), "You are a quant.").expect("write");
        assert_eq!(
            load_system_prompt(temp.path(), &AgentConfig::default()).expect("load"),
            "You are a quant."
        );
    }

    #[test]
    fn followup_embeds_results_json() {
        let results = vec![ActionResult::ListDir {
            path: Some(".".to_string()),
            items: Some(vec!["engine".to_string()]),
            outcome: Outcome::ok(),
        }];
        let message = followup_message(&results).expect("render");
        assert!(message.contains(r#"[{"type":"list_dir","path":".","items":["engine"],"status":"ok"}]"#));
        assert!(message.contains(r#"{"actions": []}"#));
    }
}
