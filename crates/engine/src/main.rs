use clap::Parser;
use tracing_subscriber::EnvFilter;

use na_engine::cli::{self, Cli, Command};
use na_engine::runtime::InboundMessage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let (config, config_path) = cli::load_config(cli.config)?;

    match cli.command {
        Command::Run {
            message,
            channel,
            sender,
            thread,
            json,
        } => {
            let msg = InboundMessage {
                thread,
                ..InboundMessage::new(channel, sender, message)
            };
            cli::run::run(&config, msg, json).await
        }
        Command::Tools { json } => cli::tools::list(&config, json).await,
        Command::Check => {
            if !cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config => cli::config::show(&config),
    }
}

/// Logs go to stderr so stdout carries only the reply.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,na_engine=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
