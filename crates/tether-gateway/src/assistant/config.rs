//! Assistant child configuration.

use std::path::PathBuf;
use std::time::Duration;

use tether_core::constants::{ASSISTANT_INIT_TIMEOUT, CHAT_RESPONSE_TIMEOUT, DEFAULT_TERM};

/// API keys passed through to the child when present in the environment.
const PASSTHROUGH_KEYS: &[&str] = &["ANTHROPIC_API_KEY", "OPENAI_API_KEY"];

/// Configuration for the assistant child process.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Assistant binary.
    pub program: String,
    /// Model name, passed as `--model`.
    pub model: String,
    /// Edit format, passed as `--edit-format`.
    pub edit_format: Option<String>,
    /// Repo-map token budget, passed as `--map-tokens`.
    pub map_tokens: Option<u32>,
    /// Let the assistant commit its own edits.
    pub auto_commit: bool,
    /// Disable git integration entirely.
    pub no_git: bool,
    /// Files attached to the session up front.
    pub files: Vec<String>,
    /// Files attached read-only, each passed as `--read`.
    pub read_only: Vec<String>,
    /// Working directory for the child.
    pub workdir: PathBuf,
    /// Where conversation snapshots are written.
    pub data_dir: PathBuf,
    /// Watch the workdir for file changes.
    pub watch_files: bool,
    /// Time allowed for the child to reach its first prompt.
    pub init_timeout: Duration,
    /// Overall deadline for one chat response.
    pub chat_timeout: Duration,
}

impl AssistantConfig {
    /// Config rooted at a working directory, snapshots under
    /// `<workdir>/.tether/contexts`.
    pub fn for_workdir(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        let data_dir = workdir.join(".tether").join("contexts");
        Self {
            program: "aider".into(),
            model: String::new(),
            edit_format: None,
            map_tokens: None,
            auto_commit: false,
            no_git: false,
            files: Vec::new(),
            read_only: Vec::new(),
            workdir,
            data_dir,
            watch_files: true,
            init_timeout: ASSISTANT_INIT_TIMEOUT,
            chat_timeout: CHAT_RESPONSE_TIMEOUT,
        }
    }

    /// Build the child's argument vector.
    ///
    /// Always includes the non-interactive confirm flag and disables fancy
    /// output; the gateway handles streaming itself.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if !self.model.is_empty() {
            args.push("--model".into());
            args.push(self.model.clone());
        }

        args.push("--yes-always".into());

        if self.no_git {
            args.push("--no-git".into());
        }
        if self.auto_commit {
            args.push("--auto-commit".into());
        }

        if let Some(format) = &self.edit_format {
            args.push("--edit-format".into());
            args.push(format.clone());
        }
        if let Some(tokens) = self.map_tokens {
            args.push("--map-tokens".into());
            args.push(tokens.to_string());
        }

        args.push("--no-pretty".into());
        args.push("--no-stream".into());

        for file in &self.files {
            args.push(file.clone());
        }
        for file in &self.read_only {
            args.push("--read".into());
            args.push(file.clone());
        }

        args
    }

    /// Environment for the child: terminal type plus passed-through API
    /// keys.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![("TERM".to_string(), DEFAULT_TERM.to_string())];
        for key in PASSTHROUGH_KEYS {
            if let Ok(value) = std::env::var(key) {
                env.push((key.to_string(), value));
            }
        }
        env
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_include_model_and_noninteractive_flags() {
        let mut config = AssistantConfig::for_workdir("/work");
        config.model = "claude-sonnet".into();

        let args = config.args();
        let joined = args.join(" ");
        assert!(joined.contains("--model claude-sonnet"));
        assert!(joined.contains("--yes-always"));
        assert!(joined.contains("--no-pretty"));
        assert!(joined.contains("--no-stream"));
        assert!(!joined.contains("--no-git"));
        assert!(!joined.contains("--auto-commit"));
    }

    #[test]
    fn optional_flags_appear_when_configured() {
        let mut config = AssistantConfig::for_workdir("/work");
        config.edit_format = Some("diff".into());
        config.map_tokens = Some(2048);
        config.no_git = true;
        config.auto_commit = true;
        config.files = vec!["src/main.rs".into()];
        config.read_only = vec!["README.md".into()];

        let args = config.args();
        let joined = args.join(" ");
        assert!(joined.contains("--edit-format diff"));
        assert!(joined.contains("--map-tokens 2048"));
        assert!(joined.contains("--no-git"));
        assert!(joined.contains("--auto-commit"));
        assert!(joined.contains("--read README.md"));

        // Attached files come before read-only flags.
        let main_pos = args.iter().position(|a| a == "src/main.rs").unwrap();
        let read_pos = args.iter().position(|a| a == "--read").unwrap();
        assert!(main_pos < read_pos);
    }

    #[test]
    fn empty_model_is_omitted() {
        let config = AssistantConfig::for_workdir("/work");
        assert!(!config.args().contains(&"--model".to_string()));
    }

    #[test]
    fn data_dir_defaults_under_workdir() {
        let config = AssistantConfig::for_workdir("/work");
        assert_eq!(config.data_dir, PathBuf::from("/work/.tether/contexts"));
    }
}
