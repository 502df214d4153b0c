use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sa_gateway::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Default to an interactive chat session when no subcommand is given.
    let command = cli.command.unwrap_or(Command::Chat { conversation: None });

    match command {
        Command::Chat { conversation } => {
            init_tracing();
            let (config, _config_path) = sa_gateway::cli::load_config()?;
            sa_gateway::cli::chat::chat(Arc::new(config), conversation).await
        }
        Command::Run { message, conversation, json } => {
            init_tracing();
            let (config, _config_path) = sa_gateway::cli::load_config()?;
            sa_gateway::cli::run::run(Arc::new(config), message, conversation, json).await
        }
        Command::Doctor => {
            let (config, config_path) = sa_gateway::cli::load_config()?;
            let passed = sa_gateway::cli::doctor::run(&config, &config_path).await?;
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Validate) => {
            let (config, config_path) = sa_gateway::cli::load_config()?;
            let valid = sa_gateway::cli::config::validate(&config, &config_path);
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Show) => {
            let (config, _config_path) = sa_gateway::cli::load_config()?;
            sa_gateway::cli::config::show(&config);
            Ok(())
        }
        Command::Version => {
            println!("serialagent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured tracing for every subcommand that runs the
/// turn engine.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sa_gateway=debug")))
        .init();
}
