//! Gateway CLI.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use tether_core::LogFormat;

use crate::connection::{BatchConfig, WireMode};
use crate::server::GatewayConfig;

/// Log output format for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

/// Wire encoding argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum EncodingArg {
    /// JSON text frames.
    #[default]
    Json,
    /// Length-prefixed binary frames.
    Binary,
}

impl From<EncodingArg> for WireMode {
    fn from(arg: EncodingArg) -> Self {
        match arg {
            EncodingArg::Json => WireMode::Json,
            EncodingArg::Binary => WireMode::Binary,
        }
    }
}

/// tether-gateway - multiplexes AI chat, terminals, and control over one
/// WebSocket.
#[derive(Debug, Parser)]
#[command(
    name = "tether-gateway",
    version,
    about = "Connection gateway for mobile AI-assisted development"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(short = 'b', long = "bind", default_value = "127.0.0.1")]
    pub bind_addr: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value = "8090")]
    pub port: u16,

    /// Workspace directory for the assistant and terminals
    #[arg(short = 'w', long = "workdir", default_value = ".")]
    pub workdir: PathBuf,

    /// Conversation snapshot directory (default: <workdir>/.tether/contexts)
    #[arg(long = "data-dir", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Assistant binary
    #[arg(long = "assistant", default_value = "aider")]
    pub assistant: String,

    /// Model name passed to the assistant
    #[arg(short = 'm', long = "model", default_value = "")]
    pub model: String,

    /// Edit format passed to the assistant
    #[arg(long = "edit-format", value_name = "FORMAT")]
    pub edit_format: Option<String>,

    /// Repo-map token budget passed to the assistant
    #[arg(long = "map-tokens", value_name = "N")]
    pub map_tokens: Option<u32>,

    /// Let the assistant auto-commit its edits
    #[arg(long = "auto-commit")]
    pub auto_commit: bool,

    /// Disable the assistant's git integration
    #[arg(long = "no-git")]
    pub no_git: bool,

    /// Files to attach to the assistant session (repeatable)
    #[arg(long = "file", action = ArgAction::Append, value_name = "PATH")]
    pub files: Vec<String>,

    /// Files to attach read-only (repeatable)
    #[arg(long = "read", action = ArgAction::Append, value_name = "PATH")]
    pub read_only: Vec<String>,

    /// Disable the project file watcher
    #[arg(long = "no-watch")]
    pub no_watch: bool,

    /// Shell for new terminals (default: $SHELL)
    #[arg(long = "shell", value_name = "PATH")]
    pub shell: Option<String>,

    /// Maximum concurrent terminals
    #[arg(long = "max-terminals", default_value_t = tether_core::constants::MAX_TERMINALS)]
    pub max_terminals: usize,

    /// Environment variables for terminals (NAME=VALUE, repeatable)
    #[arg(long = "env", action = ArgAction::Append, value_name = "VAR")]
    pub env_vars: Vec<String>,

    /// Outbound wire encoding
    #[arg(long = "encoding", default_value = "json")]
    pub encoding: EncodingArg,

    /// Batch outbound messages (binary encoding benefits most)
    #[arg(long = "batch")]
    pub batch: bool,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// Parsed NAME=VALUE environment pairs.
    pub fn parse_env_vars(&self) -> Vec<(String, String)> {
        self.env_vars
            .iter()
            .filter_map(|kv| {
                kv.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }

    /// Listen address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Build the full gateway configuration.
    pub fn into_config(self) -> GatewayConfig {
        let mut config = GatewayConfig::for_workdir(&self.workdir);
        config.bind = self.socket_addr();
        config.wire = self.encoding.into();
        config.runtime.batching = self.batch.then(BatchConfig::default);

        config.manager.max_sessions = self.max_terminals;
        config.manager.base_env = self.parse_env_vars();
        if let Some(shell) = &self.shell {
            config.manager.shell = shell.clone();
        }

        config.assistant.program = self.assistant;
        config.assistant.model = self.model;
        config.assistant.edit_format = self.edit_format;
        config.assistant.map_tokens = self.map_tokens;
        config.assistant.auto_commit = self.auto_commit;
        config.assistant.no_git = self.no_git;
        config.assistant.files = self.files;
        config.assistant.read_only = self.read_only;
        config.assistant.watch_files = !self.no_watch;
        if let Some(data_dir) = self.data_dir {
            config.assistant.data_dir = data_dir;
        }

        config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["tether-gateway"]);
        assert_eq!(cli.port, 8090);
        assert_eq!(cli.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cli.encoding, EncodingArg::Json);
        assert!(!cli.batch);
    }

    #[test]
    fn env_vars_parse_and_skip_malformed() {
        let cli = Cli::parse_from([
            "tether-gateway",
            "--env",
            "FOO=bar",
            "--env",
            "broken",
            "--env",
            "BAZ=1=2",
        ]);
        let vars = cli.parse_env_vars();
        assert_eq!(
            vars,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("BAZ".to_string(), "1=2".to_string()),
            ]
        );
    }

    #[test]
    fn config_reflects_flags() {
        let cli = Cli::parse_from([
            "tether-gateway",
            "--port",
            "9001",
            "--model",
            "claude-sonnet",
            "--encoding",
            "binary",
            "--batch",
            "--max-terminals",
            "5",
            "--no-watch",
        ]);
        let config = cli.into_config();

        assert_eq!(config.bind.port(), 9001);
        assert_eq!(config.wire, WireMode::Binary);
        assert!(config.runtime.batching.is_some());
        assert_eq!(config.manager.max_sessions, 5);
        assert_eq!(config.assistant.model, "claude-sonnet");
        assert!(!config.assistant.watch_files);
    }

    #[test]
    fn data_dir_override() {
        let cli = Cli::parse_from(["tether-gateway", "--data-dir", "/var/lib/tether"]);
        let config = cli.into_config();
        assert_eq!(config.assistant.data_dir, PathBuf::from("/var/lib/tether"));
    }
}
