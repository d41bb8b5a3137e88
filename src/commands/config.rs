use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use fleetlink::config::{ConfigUpdate, load_or_default};

#[derive(Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Default command TTL in seconds
    #[arg(long = "default-ttl")]
    pub default_ttl_seconds: Option<i64>,

    /// Default redelivery budget per command
    #[arg(long = "max-retries")]
    pub default_max_retries: Option<u32>,

    /// Expiry sweeper interval in seconds
    #[arg(long = "sweep-interval")]
    pub sweep_interval_seconds: Option<u64>,

    #[arg(long)]
    pub channel_buffer: Option<usize>,

    #[arg(long)]
    pub list_page_size: Option<usize>,

    /// Snowflake node id used for command ids (0-255)
    #[arg(long)]
    pub node_id: Option<u16>,
}

pub fn execute(config_path: Option<PathBuf>, args: ConfigArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;

    let ConfigArgs {
        port,
        data_dir,
        default_ttl_seconds,
        default_max_retries,
        sweep_interval_seconds,
        channel_buffer,
        list_page_size,
        node_id,
    } = args;

    let update = ConfigUpdate {
        port,
        data_dir,
        default_ttl_seconds,
        default_max_retries,
        sweep_interval_seconds,
        channel_buffer,
        list_page_size,
        node_id,
    };

    if update.is_empty() {
        println!("{}", toml::to_string_pretty(&config)?);
        println!("# config file: {}", path.display());
        return Ok(());
    }

    config.apply_update(update);
    config.ensure_data_dir()?;
    config.save(&path)?;

    println!("Configuration saved to {}", path.display());
    Ok(())
}
