//! Command whitelist gate.
//!
//! [`WhitelistMode::Prefix`] compares raw strings: anything appended after an
//! allowed prefix passes, shell operators included. [`WhitelistMode::Tokens`]
//! splits both sides into shell words, requires the prefix words to match the
//! leading command words exactly, and rejects shell operators outright. In
//! tokens mode commands are executed without a shell.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static SHELL_META_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[;&|<>`$\n\r]|^\(|\)$").unwrap());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhitelistMode {
    #[default]
    Prefix,
    Tokens,
}

/// Ordered allow-list of command prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandWhitelist {
    prefixes: Vec<String>,
    mode: WhitelistMode,
}

impl CommandWhitelist {
    pub fn new<I, S>(prefixes: I, mode: WhitelistMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            mode,
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn mode(&self) -> WhitelistMode {
        self.mode
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        self.matching_prefix(command).is_some()
    }

    /// First allowed prefix that admits `command`.
    pub fn matching_prefix(&self, command: &str) -> Option<&str> {
        let command = command.trim();
        if command.is_empty() {
            return None;
        }
        match self.mode {
            WhitelistMode::Prefix => self
                .prefixes
                .iter()
                .find(|prefix| command.starts_with(prefix.as_str()))
                .map(String::as_str),
            WhitelistMode::Tokens => {
                let words = tokenize(command)?;
                if words.iter().any(|word| SHELL_META_RE.is_match(word)) {
                    return None;
                }
                self.prefixes
                    .iter()
                    .find(|prefix| {
                        tokenize(prefix).is_some_and(|prefix_words| {
                            !prefix_words.is_empty() && words.starts_with(&prefix_words)
                        })
                    })
                    .map(String::as_str)
            }
        }
    }

    /// Message naming the rejected request and every allowed prefix.
    pub fn blocked_message(&self, command: &str) -> String {
        let mut message = String::from("command blocked. Only these command prefixes are allowed:\n");
        for prefix in &self.prefixes {
            message.push_str("- ");
            message.push_str(prefix);
            message.push_str(" ...\n");
        }
        if self.mode == WhitelistMode::Tokens {
            message.push_str("(shell operators are not permitted)\n");
        }
        message.push_str(&format!("requested command: {}", command.trim()));
        message
    }
}

/// Split a command into shell words; `None` when quoting is unbalanced.
pub fn tokenize(command: &str) -> Option<Vec<String>> {
    shell_words::split(command).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab_prefixes() -> Vec<&'static str> {
        vec![
            "python engine/fetch_data.py",
            "python engine/backtest.py",
            "pip install -r requirements.txt",
        ]
    }

    #[test]
    fn prefix_mode_allows_matching_commands() {
        let whitelist = CommandWhitelist::new(lab_prefixes(), WhitelistMode::Prefix);
        assert!(whitelist.is_allowed(
            "python engine/backtest.py strategies/example_ma_crossover.py"
        ));
        assert!(whitelist.is_allowed("  pip install -r requirements.txt  "));
        assert_eq!(
            whitelist.matching_prefix("python engine/fetch_data.py BTC-USD"),
            Some("python engine/fetch_data.py")
        );
    }

    #[test]
    fn prefix_mode_rejects_other_commands() {
        let whitelist = CommandWhitelist::new(lab_prefixes(), WhitelistMode::Prefix);
        assert!(!whitelist.is_allowed("rm -rf /"));
        assert!(!whitelist.is_allowed("python agent/driver.py"));
        assert!(!whitelist.is_allowed(""));
        assert!(!whitelist.is_allowed("   "));
    }

    #[test]
    fn prefix_mode_passes_any_suffix() {
        let whitelist = CommandWhitelist::new(lab_prefixes(), WhitelistMode::Prefix);
        assert!(whitelist.is_allowed("python engine/backtest.py x.py; rm -rf data"));
        assert!(whitelist.is_allowed("python engine/backtest.py_evil.py"));
    }

    #[test]
    fn tokens_mode_matches_whole_words() {
        let whitelist = CommandWhitelist::new(lab_prefixes(), WhitelistMode::Tokens);
        assert!(whitelist.is_allowed(
            "python  engine/backtest.py   strategies/example_ma_crossover.py"
        ));
        assert!(!whitelist.is_allowed("python engine/backtest.py_evil.py"));
        assert!(!whitelist.is_allowed("python engine"));
    }

    #[test]
    fn tokens_mode_rejects_shell_operators() {
        let whitelist = CommandWhitelist::new(lab_prefixes(), WhitelistMode::Tokens);
        assert!(!whitelist.is_allowed("python engine/backtest.py x.py; rm -rf data"));
        assert!(!whitelist.is_allowed("python engine/backtest.py x.py && curl evil"));
        assert!(!whitelist.is_allowed("python engine/backtest.py $(whoami)"));
        assert!(!whitelist.is_allowed("python engine/backtest.py 'unbalanced"));
    }

    #[test]
    fn blocked_message_names_request_and_prefixes() {
        let whitelist = CommandWhitelist::new(lab_prefixes(), WhitelistMode::Prefix);
        let message = whitelist.blocked_message(" ls -la ");
        assert!(message.contains("requested command: ls -la"));
        for prefix in lab_prefixes() {
            assert!(message.contains(prefix), "missing {prefix}");
        }
    }
}
