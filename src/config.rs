//! Application configuration
//!
//! Each role keeps its own TOML file under the platform config directory.
//! The device id is generated on first run and persisted so the identity
//! other devices remember stays stable across restarts.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::{DeviceIdentity, DeviceType};
use crate::session::{CoordinatorTimings, RuntimeOptions, SessionTimings};

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub ui: UiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Generated on first run when empty
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_address: IpAddr,
    /// 0 picks a free port
    pub listen_port: u16,
    /// Open a UDP side channel next to every session
    pub enable_stream: bool,
    pub discovery_port: u16,
    pub max_frame_len: usize,
    pub beacon_interval_ms: u64,
}

/// Protocol timers in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub handshake_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub keep_alive_timeout_ms: u64,
    pub pairing_request_timeout_ms: u64,
    pub maintenance_interval_ms: u64,
    pub publish_check_interval_ms: u64,
    pub clock_sync_interval_ms: u64,
    pub cancel_grace_ms: u64,
    pub disconnect_grace_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::for_role(DeviceType::Main)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: "LiveSync Presenter".to_string(),
            device_type: DeviceType::Main,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 0,
            enable_stream: true,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            max_frame_len: MAX_FRAME_LEN,
            beacon_interval_ms: 3_000,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            keep_alive_interval_ms: KEEP_ALIVE_INTERVAL_MS,
            keep_alive_timeout_ms: KEEP_ALIVE_TIMEOUT_MS,
            pairing_request_timeout_ms: PAIRING_REQUEST_TIMEOUT_MS,
            maintenance_interval_ms: MAINTENANCE_INTERVAL_MS,
            publish_check_interval_ms: PUBLISH_CHECK_INTERVAL_MS,
            clock_sync_interval_ms: CLOCK_SYNC_INTERVAL_MS,
            cancel_grace_ms: CANCEL_GRACE_MS,
            disconnect_grace_ms: DISCONNECT_GRACE_MS,
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl AppConfig {
    /// Defaults for a presenter (`Main`) or companion (`Connector`)
    pub fn for_role(device_type: DeviceType) -> Self {
        let (name, http_port) = match device_type {
            DeviceType::Main => ("LiveSync Presenter", DEFAULT_HTTP_PORT),
            DeviceType::Connector => ("LiveSync Companion", DEFAULT_HTTP_PORT + 1),
        };
        Self {
            device: DeviceConfig {
                id: String::new(),
                name: name.to_string(),
                device_type,
            },
            network: NetworkConfig::default(),
            timing: TimingConfig::default(),
            ui: UiConfig {
                http_port,
                ..UiConfig::default()
            },
        }
    }

    /// `<config dir>/<role>.toml`
    pub fn default_path(device_type: DeviceType) -> Option<PathBuf> {
        let dirs = ProjectDirs::from("", "", "livesync")?;
        let file = match device_type {
            DeviceType::Main => "presenter.toml",
            DeviceType::Connector => "companion.toml",
        };
        Some(dirs.config_dir().join(file))
    }

    /// Load the role's config file, creating it with defaults (and a fresh
    /// device id) when missing.
    pub fn load_or_create(device_type: DeviceType) -> Result<Self> {
        let path = Self::default_path(device_type)
            .ok_or_else(|| Error::Config("no home directory for configuration".to_string()))?;
        Self::load_or_create_at(&path, device_type)
    }

    pub fn load_or_create_at(path: &Path, device_type: DeviceType) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            tracing::info!("Creating configuration at {}", path.display());
            Self::for_role(device_type)
        };

        // The file decides everything except which role it is for
        config.device.device_type = device_type;
        if config.device.id.trim().is_empty() {
            config.device.id = uuid::Uuid::new_v4().to_string();
            config.save(path)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&contents).map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(format!("failed to encode: {}", e)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.name.trim().is_empty() {
            return Err(Error::Config("device.name must not be empty".to_string()));
        }
        if self.network.max_frame_len == 0 {
            return Err(Error::Config("network.max_frame_len must be positive".to_string()));
        }

        let t = &self.timing;
        let timers = [
            ("handshake_timeout_ms", t.handshake_timeout_ms),
            ("keep_alive_interval_ms", t.keep_alive_interval_ms),
            ("keep_alive_timeout_ms", t.keep_alive_timeout_ms),
            ("pairing_request_timeout_ms", t.pairing_request_timeout_ms),
            ("maintenance_interval_ms", t.maintenance_interval_ms),
            ("publish_check_interval_ms", t.publish_check_interval_ms),
            ("clock_sync_interval_ms", t.clock_sync_interval_ms),
            ("cancel_grace_ms", t.cancel_grace_ms),
            ("disconnect_grace_ms", t.disconnect_grace_ms),
            ("beacon_interval_ms", self.network.beacon_interval_ms),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("timing value {} must be positive", name)));
        }
        if t.keep_alive_timeout_ms <= t.keep_alive_interval_ms {
            return Err(Error::Config(
                "keep_alive_timeout_ms must be larger than keep_alive_interval_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.device.id.clone(), self.device.device_type, self.device.name.clone())
    }

    pub fn session_timings(&self) -> SessionTimings {
        SessionTimings {
            handshake_timeout: Duration::from_millis(self.timing.handshake_timeout_ms),
            keep_alive_interval: Duration::from_millis(self.timing.keep_alive_interval_ms),
            keep_alive_timeout: Duration::from_millis(self.timing.keep_alive_timeout_ms),
            max_frame_len: self.network.max_frame_len,
        }
    }

    pub fn coordinator_timings(&self) -> CoordinatorTimings {
        CoordinatorTimings {
            session: self.session_timings(),
            pairing_request_timeout: Duration::from_millis(self.timing.pairing_request_timeout_ms),
            maintenance_interval: Duration::from_millis(self.timing.maintenance_interval_ms),
            publish_check_interval: Duration::from_millis(self.timing.publish_check_interval_ms),
            clock_sync_interval: Duration::from_millis(self.timing.clock_sync_interval_ms),
            cancel_grace: Duration::from_millis(self.timing.cancel_grace_ms),
            disconnect_grace: Duration::from_millis(self.timing.disconnect_grace_ms),
        }
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            identity: self.identity(),
            listen_addr: SocketAddr::new(self.network.listen_address, self.network.listen_port),
            enable_stream: self.network.enable_stream,
            timings: self.coordinator_timings(),
        }
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.network.beacon_interval_ms)
    }
}
