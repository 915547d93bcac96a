//! Configuration loading for the debug link

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use crate::{LinkError, Result};

/// UDP port the robots answer discovery probes and debug traffic on
pub const DEBUG_PORT: u16 = 10350;
/// TCP port of the robot's image server
pub const IMAGE_PORT: u16 = 10350;
/// UDP port of the robot monitor daemon
pub const MONITOR_PORT: u16 = 10399;
/// Base port for SPL team communication, offset by the team number
pub const SPL_BASE_PORT: u16 = 10000;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkConfig {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
    pub images: ImageConfig,
    pub dispatch: DispatchConfig,
    pub spl: SplConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: SocketAddr,
    pub read_timeout_ms: u64,
    pub max_datagram: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub interval_ms: u64,
    pub search_ips: Vec<String>,
    pub extra_broadcasts: Vec<String>,
    pub include_interfaces: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub keepalive_interval_ms: u64,
    pub expiry_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImageConfig {
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_frame_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SplConfig {
    pub enabled: bool,
    pub team_number: u8,
    pub max_datagram: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            read_timeout_ms: 500,
            max_datagram: 65515,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEBUG_PORT,
            interval_ms: 1000,
            search_ips: Vec::new(),
            extra_broadcasts: Vec::new(),
            include_interfaces: true,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 1000,
            expiry_ms: 10_000,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            port: IMAGE_PORT,
            connect_timeout_ms: 2000,
            read_timeout_ms: 500,
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { interval_ms: 10 }
    }
}

impl Default for SplConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            team_number: 0,
            max_datagram: 3096,
        }
    }
}

impl LinkConfig {
    /// Load configuration from a YAML file
    pub fn load_from_path(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("Failed to read {}: {}", path, e)))?;
        Self::load_from_str(&contents)
    }

    /// Parse configuration from a YAML string
    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: LinkConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.keepalive_interval_ms >= self.connection.expiry_ms {
            return Err(LinkError::Config(format!(
                "keepalive interval ({} ms) must be shorter than the expiry window ({} ms)",
                self.connection.keepalive_interval_ms, self.connection.expiry_ms
            )));
        }
        if self.network.read_timeout_ms == 0 || self.images.read_timeout_ms == 0 {
            return Err(LinkError::Config("read timeouts must be non-zero".to_string()));
        }
        if self.images.connect_timeout_ms == 0 {
            return Err(LinkError::Config("image connect timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl NetworkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ConnectionConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }
}

impl ImageConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl DispatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl SplConfig {
    /// UDP port the team broadcasts its standard messages on
    pub fn port(&self) -> u16 {
        SPL_BASE_PORT + self.team_number as u16
    }
}
