use crate::config::Config;
use crate::daemon::Loops;
use clap::{Parser, Subcommand};
use eyre::{Context, OptionExt};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

const DEFAULT_CONFIG_FILE: &str = ".pirateaudio.env";

#[derive(Debug, Parser)]
#[command(version, about, author)]
struct Cli {
    /// key=value file providing HA_URL, HA_TOKEN and optional overrides
    #[arg(long, global = true, env = "PIRATEDECK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Eq, PartialEq, Subcommand, Clone, Copy)]
enum Commands {
    /// Forward button presses to the media player
    Buttons,
    /// Mirror the media player state on the screen
    Display,
    /// Run both loops (default)
    Run,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .init();
    stable_eyre::install()?;

    let cli = Cli::parse();
    tracing::debug!("Parsed command line arguments {:?}", &cli);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => dirs_next::home_dir()
            .ok_or_eyre("No home directory, pass --config")?
            .join(DEFAULT_CONFIG_FILE),
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;

    let loops = match cli.command.unwrap_or(Commands::Run) {
        Commands::Buttons => Loops::Buttons,
        Commands::Display => Loops::Display,
        Commands::Run => Loops::Both,
    };
    daemon::run(config, loops).await
}

mod config;
mod daemon;
mod remote;
