use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;

use fleetlink::config::load_or_default;

use super::{api_base, api_error, fetch_json, print_json};

#[derive(Subcommand)]
pub enum CommandCommands {
    /// Issue a command to a device
    Issue(IssueArgs),
    /// List commands, optionally filtered by device or status
    List(ListArgs),
    /// Show a single command record
    Show(ShowArgs),
    /// Cancel a command that has not been delivered yet
    Cancel(ShowArgs),
}

#[derive(Args)]
pub struct IssueArgs {
    /// Target device identifier
    pub device_id: String,

    /// Command type (e.g. take_photo, lock_device, sync_config)
    pub kind: String,

    /// Command payload as a JSON object
    #[arg(long)]
    pub payload: Option<String>,

    /// Delivery priority: low, normal, high, urgent
    #[arg(long)]
    pub priority: Option<String>,

    /// Seconds before the command expires
    #[arg(long)]
    pub ttl: Option<i64>,

    /// Maximum delivery attempts before the command is failed
    #[arg(long)]
    pub max_retries: Option<u32>,
}

#[derive(Args, Default)]
pub struct ListArgs {
    /// Only show commands for this device
    #[arg(long)]
    pub device: Option<String>,

    /// Only show commands with this status
    #[arg(long)]
    pub status: Option<String>,

    /// Maximum number of records to return
    #[arg(long)]
    pub take: Option<usize>,
}

#[derive(Args)]
pub struct ShowArgs {
    /// Command identifier
    pub command_id: String,
}

pub async fn execute(config_path: Option<PathBuf>, command: CommandCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let base = api_base(&config);

    match command {
        CommandCommands::Issue(args) => {
            let payload = match args.payload.as_deref() {
                Some(raw) => {
                    serde_json::from_str::<Value>(raw).context("--payload must be valid JSON")?
                }
                None => Value::Null,
            };
            let body = json!({
                "device_id": args.device_id,
                "kind": args.kind,
                "payload": payload,
                "priority": args.priority,
                "ttl_seconds": args.ttl,
                "max_retries": args.max_retries,
            });
            let url = format!("{base}/v1/commands");
            let response = reqwest::Client::new()
                .post(&url)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("failed to reach FleetLink server at {url}"))?;
            if !response.status().is_success() {
                return Err(api_error(response).await);
            }
            print_json(&response.json().await?)
        }
        CommandCommands::List(args) => {
            let mut url = format!("{base}/v1/commands");
            let mut params = Vec::new();
            if let Some(device) = &args.device {
                params.push(format!("device_id={device}"));
            }
            if let Some(status) = &args.status {
                params.push(format!("status={status}"));
            }
            if let Some(take) = args.take {
                params.push(format!("take={take}"));
            }
            if !params.is_empty() {
                url.push('?');
                url.push_str(&params.join("&"));
            }
            print_json(&fetch_json(&url).await?)
        }
        CommandCommands::Show(args) => {
            let command = fetch_json(&format!("{base}/v1/commands/{}", args.command_id)).await?;
            print_json(&command)
        }
        CommandCommands::Cancel(args) => {
            let url = format!("{base}/v1/commands/{}", args.command_id);
            let response = reqwest::Client::new()
                .delete(&url)
                .send()
                .await
                .with_context(|| format!("failed to reach FleetLink server at {url}"))?;
            if response.status() == reqwest::StatusCode::NO_CONTENT {
                println!("Command {} cancelled.", args.command_id);
                Ok(())
            } else if response.status().is_success() {
                Ok(())
            } else {
                Err(api_error(response).await)
            }
        }
    }
}
