//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

mod commands;

#[derive(Parser)]
#[command(name = "alice")]
#[command(version)]
#[command(about = "Alice agent runtime (JSON-lines bridge over stdin/stdout)")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Project root for execution, memory and skills (default: current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Config file (default: $ALICE_HOME/config.toml)
    #[arg(long, env = "ALICE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the model from config
    #[arg(short, long)]
    model: Option<String>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the JSON-lines runtime (default)
    Bridge,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Print the config file path
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli {
        command,
        root,
        config,
        model,
    } = cli;

    match command.unwrap_or(Commands::Bridge) {
        Commands::Bridge => commands::bridge::run(&root, config.as_deref(), model.as_deref()).await,
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path(config.as_deref());
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(config.as_deref()),
        },
    }
}
