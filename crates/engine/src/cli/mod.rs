pub mod config;
pub mod run;
pub mod tools;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// nanoagent: a tool-using conversational agent.
#[derive(Debug, Parser)]
#[command(name = "nanoagent", version, about)]
pub struct Cli {
    /// Config file (overrides `NANOAGENT_CONFIG`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send a single message to the agent and print the reply.
    Run {
        /// The message to send.
        message: String,
        /// Channel the message arrives on.
        #[arg(long, default_value = "cli")]
        channel: String,
        /// Sender identity inside the channel.
        #[arg(long, default_value = "local")]
        sender: String,
        /// Thread id, for channels that have threads.
        #[arg(long)]
        thread: Option<String>,
        /// Print the full reply (outcome and artifacts) as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List every registered tool, built-in and remote.
    Tools {
        #[arg(long)]
        json: bool,
    },
    /// Parse the config file and report any errors.
    Check,
    /// Dump the resolved configuration (with defaults) as TOML.
    Config,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from `explicit`, else `NANOAGENT_CONFIG`, else
/// `config.toml`. A missing file yields the default config.
pub fn load_config(
    explicit: Option<PathBuf>,
) -> anyhow::Result<(na_domain::config::Config, PathBuf)> {
    let config_path = explicit
        .or_else(|| std::env::var_os("NANOAGENT_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", config_path.display()))?;
        toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", config_path.display()))?
    } else {
        na_domain::config::Config::default()
    };

    Ok((config, config_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, path) = load_config(Some(dir.path().join("absent.toml"))).unwrap();
        assert_eq!(path, dir.path().join("absent.toml"));
        assert_eq!(config.agent.max_iterations, 40);
    }

    #[test]
    fn explicit_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nano.toml");
        std::fs::write(&path, "[agent]\nmodel = \"local/llama\"\nmax_iterations = 7\n").unwrap();
        let (config, _) = load_config(Some(path)).unwrap();
        assert_eq!(config.agent.model, "local/llama");
        assert_eq!(config.agent.max_iterations, 7);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[agent\n").unwrap();
        let err = load_config(Some(path)).unwrap_err().to_string();
        assert!(err.contains("bad.toml"), "{err}");
    }

    #[test]
    fn check_has_no_arguments() {
        let cli = Cli::try_parse_from(["nanoagent", "check", "--config", "a.toml"]).unwrap();
        assert!(matches!(cli.command, Command::Check));
        assert_eq!(cli.config, Some(PathBuf::from("a.toml")));
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "nanoagent", "--log-json", "run", "--sender", "bob", "--thread", "t1", "hello",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.command {
            Command::Run {
                message,
                channel,
                sender,
                thread,
                json,
            } => {
                assert_eq!(message, "hello");
                assert_eq!(channel, "cli");
                assert_eq!(sender, "bob");
                assert_eq!(thread.as_deref(), Some("t1"));
                assert!(!json);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
