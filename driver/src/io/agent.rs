//! Agent abstraction for the conversation loop.
//!
//! The [`Agent`] trait decouples the loop from the model backend. The shipped
//! [`CommandAgent`] spawns an external process; tests use scripted agents that
//! return predetermined action lists.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::io::config::AgentConfig;
use crate::io::process::run_command_with_timeout;

const REPLY_SCHEMA: &str = include_str!("../../schemas/agent_reply.schema.json");

static REPLY_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(REPLY_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::validator_for(&schema).map_err(|err| err.to_string())
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Abstraction over model backends.
pub trait Agent {
    /// Given the full conversation, return the raw action objects of the next
    /// batch. An empty list ends the conversation.
    fn next_actions(&self, messages: &[Message]) -> Result<Vec<Value>>;
}

/// Agent backed by an external command.
///
/// The command receives `{"messages": [...]}` on stdin and must print a reply
/// containing `{"actions": [...]}` on stdout.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandAgent {
    pub fn new(config: &AgentConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: config.command.clone(),
            workdir: workdir.into(),
            timeout: config.timeout(),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(program = self.command.first().map(String::as_str), turns = messages.len()))]
    fn next_actions(&self, messages: &[Message]) -> Result<Vec<Value>> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("agent command is empty");
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);

        let input = serde_json::to_vec(&json!({ "messages": messages }))
            .context("serialize conversation")?;
        info!("waiting for agent reply");
        let output = run_command_with_timeout(cmd, Some(&input), self.timeout, self.output_limit_bytes)
            .context("run agent command")?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "agent timed out");
            return Err(anyhow!("agent timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "agent exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "agent reply exceeded {} bytes",
                self.output_limit_bytes
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_reply(&stdout)
    }
}

/// Extract the action list from an agent's textual reply.
///
/// The reply is parsed as JSON in full; failing that, the span from the first
/// `{` to the last `}` is tried, which tolerates prose or code fences around
/// the object. The object must match the reply schema.
pub fn parse_reply(text: &str) -> Result<Vec<Value>> {
    let value = extract_json(text)?;
    let validator = REPLY_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid reply schema: {err}"))?;
    if !validator.is_valid(&value) {
        let messages = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "agent reply schema validation failed: {}",
            messages.join("; ")
        ));
    }
    match value {
        Value::Object(mut map) => match map.remove("actions") {
            Some(Value::Array(actions)) => {
                debug!(count = actions.len(), "parsed agent reply");
                Ok(actions)
            }
            _ => Err(anyhow!("agent reply is missing an `actions` list")),
        },
        _ => Err(anyhow!("agent reply is not a JSON object")),
    }
}

fn extract_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        bail!("agent reply was empty");
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
        bail!("agent reply contains no JSON object:\n{trimmed}");
    };
    if end < start {
        bail!("agent reply contains no JSON object:\n{trimmed}");
    }
    serde_json::from_str(&trimmed[start..=end])
        .with_context(|| format!("parse agent reply as JSON:\n{trimmed}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_replies_parse() {
        let actions =
            parse_reply(r#"{"actions": [{"type": "list_dir", "path": "."}]}"#).expect("parse");
        assert_eq!(actions, vec![json!({"type": "list_dir", "path": "."})]);
    }

    #[test]
    fn fenced_replies_parse() {
        let reply = "Here you go:\n```json\n{\"actions\": []}\n```\n";
        assert!(parse_reply(reply).expect("parse").is_empty());
    }

    #[test]
    fn replies_without_actions_are_rejected() {
        let err = parse_reply(r#"{"steps": []}"#).unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));

        let err = parse_reply(r#"{"actions": "list_dir"}"#).unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn non_json_replies_are_rejected() {
        assert!(parse_reply("").is_err());
        assert!(parse_reply("I am done.").is_err());
        assert!(parse_reply("} nothing {").is_err());
    }

    #[test]
    fn messages_serialize_with_lowercase_roles() {
        let value = serde_json::to_value(Message::assistant("{}")).expect("serialize");
        assert_eq!(value, json!({"role": "assistant", "content": "{}"}));
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_reads_reply_from_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo '{\"actions\": [{\"type\": \"read_file\", \"path\": \"README.md\"}]}'"
                    .to_string(),
            ],
            ..AgentConfig::default()
        };
        let agent = CommandAgent::new(&config, temp.path());
        let actions = agent
            .next_actions(&[Message::system("sys"), Message::user("go")])
            .expect("reply");
        assert_eq!(actions, vec![json!({"type": "read_file", "path": "README.md"})]);
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_failures_are_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "echo boom >&2; exit 4".to_string()],
            ..AgentConfig::default()
        };
        let agent = CommandAgent::new(&config, temp.path());
        let err = agent.next_actions(&[Message::user("go")]).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
