use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::json;
use std::path::PathBuf;

use fleetlink::config::load_or_default;

use super::{api_base, api_error, fetch_json, print_json};

#[derive(Subcommand)]
pub enum DeviceCommands {
    /// Register a device (or update its name)
    Register(RegisterArgs),
    /// List all registered devices
    List,
    /// Show a single device
    Show(ShowArgs),
}

#[derive(Args)]
pub struct RegisterArgs {
    /// Device identifier
    pub device_id: String,

    /// Human-readable device name
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct ShowArgs {
    /// Device identifier
    pub device_id: String,
}

pub async fn execute(config_path: Option<PathBuf>, command: DeviceCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let base = api_base(&config);

    match command {
        DeviceCommands::Register(args) => {
            let url = format!("{base}/v1/devices/{}", args.device_id);
            let response = reqwest::Client::new()
                .put(&url)
                .json(&json!({ "name": args.name }))
                .send()
                .await
                .with_context(|| format!("failed to reach FleetLink server at {url}"))?;
            if !response.status().is_success() {
                return Err(api_error(response).await);
            }
            print_json(&response.json().await?)
        }
        DeviceCommands::List => {
            let devices = fetch_json(&format!("{base}/v1/devices")).await?;
            print_json(&devices)
        }
        DeviceCommands::Show(args) => {
            let device = fetch_json(&format!("{base}/v1/devices/{}", args.device_id)).await?;
            print_json(&device)
        }
    }
}
