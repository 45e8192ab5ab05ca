use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::{
    ConfigCommand, DeviceCommand, EpochCommand, RecordCommand, RoomCommand, SyncCommand,
};
use config::Config;

#[derive(Parser)]
#[command(name = "ada")]
#[command(version)]
#[command(about = "Local-first baby tracker with multi-device sync", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show device identity
    Device(DeviceCommand),

    /// Join, create or leave the shared room
    Room(RoomCommand),

    /// Show or reset the sync epoch
    Epoch(EpochCommand),

    /// Add, list and remove records
    Record(RecordCommand),

    /// Manage configuration
    Config(ConfigCommand),

    /// Sync with the relay
    Sync(SyncCommand),
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adameter_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(cli.config)?;
    tracing::debug!("Data directory: {}", config.data_dir.value.display());

    match &cli.command {
        Some(Commands::Device(cmd)) => cmd.run(&config)?,
        Some(Commands::Room(cmd)) => cmd.run(&config)?,
        Some(Commands::Epoch(cmd)) => cmd.run(&config)?,
        Some(Commands::Record(cmd)) => cmd.run(&config)?,
        Some(Commands::Config(cmd)) => cmd.run(&config)?,
        Some(Commands::Sync(cmd)) => cmd.run(&config)?,
        None => println!("Use --help to see available commands"),
    }

    Ok(())
}
