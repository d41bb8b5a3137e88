mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{
    command::CommandCommands,
    config::ConfigArgs,
    device::DeviceCommands,
    start::{DestroyArgs, StartArgs},
};

#[derive(Parser)]
#[command(author, version, about = "FleetLink command dispatch server CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.fleetlink/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the FleetLink server
    Start(StartArgs),
    /// Stop the FleetLink server
    Stop,
    /// Display FleetLink server status
    Status,
    /// Restart the FleetLink server
    Restart(StartArgs),
    /// Destroy all FleetLink data and configuration
    Destroy(DestroyArgs),
    /// Update system configuration
    Config(ConfigArgs),
    /// Manage devices
    Device {
        #[command(subcommand)]
        command: DeviceCommands,
    },
    /// Issue and inspect device commands
    Command {
        #[command(subcommand)]
        command: CommandCommands,
    },
    /// Internal command used for daemonized server execution
    #[command(name = "__internal:server", hide = true)]
    InternalServer,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Start(args) => commands::start::execute(config, args).await?,
        Commands::Stop => commands::start::stop(config)?,
        Commands::Status => commands::start::status(config)?,
        Commands::Restart(args) => restart(config, args).await?,
        Commands::Destroy(args) => commands::start::destroy(config, args)?,
        Commands::Config(args) => commands::config::execute(config, args)?,
        Commands::Device { command } => commands::device::execute(config, command).await?,
        Commands::Command { command } => commands::command::execute(config, command).await?,
        Commands::InternalServer => commands::start::run_internal(config).await?,
    }

    Ok(())
}

async fn restart(config: Option<PathBuf>, args: StartArgs) -> Result<()> {
    if let Err(err) = commands::start::stop(config.clone()) {
        eprintln!("warning: failed to stop FleetLink server before restart: {err}");
    }
    commands::start::execute(config, args).await
}
