use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

pub const DEFAULT_PORT: u16 = 7200;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_CHANNEL_BUFFER: usize = 64;

fn default_ttl_seconds() -> i64 {
    crate::command::DEFAULT_TTL_SECONDS
}

fn default_max_retries() -> u32 {
    crate::command::DEFAULT_MAX_RETRIES
}

fn default_sweep_interval_seconds() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECONDS
}

fn default_channel_buffer() -> usize {
    DEFAULT_CHANNEL_BUFFER
}

fn default_node_id() -> u16 {
    0
}

fn default_list_page_size() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Expiry horizon applied when a command is created without an explicit
    /// `ttl_seconds`.
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: i64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Outbound frames buffered per device channel before pushes fail over
    /// to the pending queue.
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
    #[serde(default = "default_node_id")]
    pub node_id: u16,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            created_at: now,
            updated_at: now,
            default_ttl_seconds: default_ttl_seconds(),
            default_max_retries: default_max_retries(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            channel_buffer: default_channel_buffer(),
            list_page_size: default_list_page_size(),
            node_id: default_node_id(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub default_ttl_seconds: Option<i64>,
    pub default_max_retries: Option<u32>,
    pub sweep_interval_seconds: Option<u64>,
    pub channel_buffer: Option<usize>,
    pub list_page_size: Option<usize>,
    pub node_id: Option<u16>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.port.is_none()
            && self.data_dir.is_none()
            && self.default_ttl_seconds.is_none()
            && self.default_max_retries.is_none()
            && self.sweep_interval_seconds.is_none()
            && self.channel_buffer.is_none()
            && self.list_page_size.is_none()
            && self.node_id.is_none()
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = default_config_root()?;
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.ensure_data_dir()?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if update.is_empty() {
            return;
        }
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(data_dir) = update.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(ttl) = update.default_ttl_seconds {
            self.default_ttl_seconds = ttl.max(1);
        }
        if let Some(retries) = update.default_max_retries {
            self.default_max_retries = retries;
        }
        if let Some(interval) = update.sweep_interval_seconds {
            self.sweep_interval_seconds = interval.max(1);
        }
        if let Some(buffer) = update.channel_buffer {
            self.channel_buffer = buffer.max(1);
        }
        if let Some(page) = update.list_page_size {
            self.list_page_size = page.max(1);
        }
        if let Some(node_id) = update.node_id {
            self.node_id = node_id;
        }
        self.updated_at = Utc::now();
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn command_store_path(&self) -> PathBuf {
        self.data_dir.join("dispatch")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir.join("fleetlink.pid")
    }

    pub fn server_addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

fn default_config_root() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        Ok(home.join(".fleetlink"))
    } else {
        env::current_dir()
            .map(|dir| dir.join(".fleetlink"))
            .map_err(|err| FleetError::Config(err.to_string()))
    }
}

fn default_data_dir() -> PathBuf {
    default_config_root()
        .map(|root| root.join("data"))
        .unwrap_or_else(|_| PathBuf::from(".fleetlink/data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.save(&path).unwrap();

        let (loaded, loaded_path) = load_or_default(Some(path.clone())).unwrap();
        assert_eq!(loaded_path, path);
        assert_eq!(loaded.port, config.port);
        assert_eq!(loaded.default_ttl_seconds, config.default_ttl_seconds);
    }

    #[test]
    fn update_touches_only_requested_fields() {
        let mut config = Config::default();
        let before = config.default_max_retries;
        config.apply_update(ConfigUpdate {
            port: Some(9000),
            ..ConfigUpdate::default()
        });
        assert_eq!(config.port, 9000);
        assert_eq!(config.default_max_retries, before);
    }

    #[test]
    fn sweep_interval_never_drops_to_zero() {
        let mut config = Config::default();
        config.apply_update(ConfigUpdate {
            sweep_interval_seconds: Some(0),
            ..ConfigUpdate::default()
        });
        assert_eq!(config.sweep_interval_seconds, 1);
    }
}
