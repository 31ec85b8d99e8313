use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub device_name: String,
    pub data_directory: String,
    pub download_directory: String,
    pub beacon: BeaconConfig,
    pub transfer: TransferConfig,
}

/// Presence announcement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconConfig {
    pub bind_address: String,
    pub port: u16,
    pub broadcast_address: String,
    pub announce_period_ms: u64,
    pub device_ttl_ms: u64,
}

/// File transfer endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub bind_address: String,
    pub port: u16,
    /// Port peers listen on when it differs from our own bind port, as with
    /// port-mapped containers. `None` means peers use the same port we do.
    #[serde(default)]
    pub peer_port: Option<u16>,
    pub chunk_size: usize,
    pub connect_timeout_ms: u64,
    pub connect_attempts: u32,
}

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("announce period must be greater than zero")]
    ZeroAnnouncePeriod,

    #[error("device TTL ({ttl_ms} ms) must exceed the announce period ({period_ms} ms)")]
    TtlNotAboveAnnouncePeriod { ttl_ms: u64, period_ms: u64 },

    #[error("chunk size {0} bytes is outside the supported 4096..=1048576 range")]
    ChunkSizeOutOfRange(usize),

    #[error("connect attempts must be at least 1")]
    ZeroConnectAttempts,
}

impl Default for AppConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let data_dir = format!("{}/.lanbeam", home);

        Self {
            device_name: default_device_name(),
            data_directory: data_dir.clone(),
            download_directory: format!("{}/downloads", data_dir),
            beacon: BeaconConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 52515,
                broadcast_address: "255.255.255.255".to_string(),
                announce_period_ms: 2000,
                device_ttl_ms: 6000,
            },
            transfer: TransferConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 52516,
                peer_port: None,
                chunk_size: 64 * 1024,
                connect_timeout_ms: 5000,
                connect_attempts: 3,
            },
        }
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unnamed-device".to_string())
}

impl AppConfig {
    /// Load configuration from file or create default
    pub fn load_or_default(config_path: Option<&str>) -> Self {
        if let Some(config) = config_path
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
        {
            return config;
        }
        Self::default()
    }

    /// Save configuration to file
    pub fn save_to_file(&self, config_path: &str) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Get the data directory as PathBuf
    pub fn data_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.data_directory)
    }

    /// Get the download directory as PathBuf
    pub fn download_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.download_directory)
    }

    /// Where the signing keypair lives
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir_path().join("identity.json")
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(&self.data_directory)?;
        std::fs::create_dir_all(&self.download_directory)?;
        Ok(())
    }

    /// Validate configuration
    ///
    /// The TTL invariant is load-bearing: a TTL at or below the announce period
    /// makes every healthy peer flap between present and expired.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.beacon.announce_period_ms == 0 {
            return Err(ConfigError::ZeroAnnouncePeriod);
        }

        if self.beacon.device_ttl_ms <= self.beacon.announce_period_ms {
            return Err(ConfigError::TtlNotAboveAnnouncePeriod {
                ttl_ms: self.beacon.device_ttl_ms,
                period_ms: self.beacon.announce_period_ms,
            });
        }

        if self.transfer.chunk_size < MIN_CHUNK_SIZE || self.transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSizeOutOfRange(self.transfer.chunk_size));
        }

        if self.transfer.connect_attempts == 0 {
            return Err(ConfigError::ZeroConnectAttempts);
        }

        Ok(())
    }
}

impl BeaconConfig {
    pub fn announce_period(&self) -> Duration {
        Duration::from_millis(self.announce_period_ms)
    }

    pub fn device_ttl(&self) -> Duration {
        Duration::from_millis(self.device_ttl_ms)
    }
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Port to dial on a peer.
    pub fn dial_port(&self) -> u16 {
        self.peer_port.unwrap_or(self.port)
    }
}
