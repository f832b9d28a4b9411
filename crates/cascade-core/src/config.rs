//! Configuration for both ends of a transfer.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CASCADE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cascade/config.toml
//!   3. ~/.config/cascade/config.toml

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::psk::PassphraseEncoding;

/// Default status-report cadence.
const DEFAULT_UPDATE_INTERVAL_MS: u64 = 1_000;

/// Default control-channel read timeout.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 600;

/// Server-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path MTU the multicast datagrams must fit.
    pub mtu: usize,
    /// Derive block sizes for an IPv6 data plane.
    pub ipv6: bool,
    /// Admission cap per session.
    pub max_connections_per_session: usize,
    /// Cap on concurrently live sessions.
    pub max_sessions: usize,
    /// Multicast group address shared by all sessions.
    pub multicast_address: IpAddr,
    /// Session `n` publishes on `multicast_start_port + n`.
    pub multicast_start_port: u16,
    /// Datagrams enqueued per burst before the sender yields.
    pub multicast_burst_length: usize,
    /// Multicast TTL (hop limit on v6).
    pub ttl: u32,
    /// TCP endpoint the control listener binds.
    pub bind_address: String,
    /// Directory the payload paths resolve beneath.
    pub root_folder: PathBuf,
    /// Outgoing multicast interface. v4 interfaces by address, v6 by
    /// name. Empty = OS default.
    pub interface_name: String,
    /// Pass-phrase; empty disables the PSK cipher and sealed channels.
    pub passphrase: String,
    pub passphrase_encoding: PassphraseEncoding,
    pub read_timeout_secs: u64,
    pub packet_update_interval_ms: u64,
    /// How long an empty session lingers before it is torn down.
    pub idle_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            ipv6: false,
            max_connections_per_session: 32,
            max_sessions: 8,
            multicast_address: "239.255.12.42".parse().unwrap(),
            multicast_start_port: 7700,
            multicast_burst_length: 64,
            ttl: 1,
            bind_address: "0.0.0.0:7650".into(),
            root_folder: PathBuf::from("/srv/cascade"),
            interface_name: String::new(),
            passphrase: String::new(),
            passphrase_encoding: PassphraseEncoding::default(),
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            packet_update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
            idle_grace_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn packet_update_interval(&self) -> Duration {
        Duration::from_millis(self.packet_update_interval_ms)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    /// Waiting budget for `WaveStatusUpdate`s at a wave boundary.
    pub fn wave_boundary_timeout(&self) -> Duration {
        self.read_timeout().max(2 * self.packet_update_interval())
    }

    pub fn passphrase(&self) -> Option<&str> {
        (!self.passphrase.is_empty()).then_some(self.passphrase.as_str())
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if !self.multicast_address.is_multicast() {
            return Err(TransferError::ConfigInvalid(format!(
                "{} is not a multicast address",
                self.multicast_address
            )));
        }
        if self.multicast_address.is_ipv6() != self.ipv6 {
            return Err(TransferError::ConfigInvalid(
                "multicast address family does not match the ipv6 flag".into(),
            ));
        }
        if self.max_sessions == 0 || self.max_connections_per_session == 0 {
            return Err(TransferError::ConfigInvalid(
                "session and connection limits must be positive".into(),
            ));
        }
        if self.multicast_burst_length == 0 {
            return Err(TransferError::ConfigInvalid(
                "multicast_burst_length must be positive".into(),
            ));
        }
        if self.multicast_start_port as u64 + self.max_sessions as u64 - 1 > u16::MAX as u64 {
            return Err(TransferError::ConfigInvalid(
                "multicast port range overflows u16".into(),
            ));
        }
        if self.root_folder.as_os_str().is_empty() {
            return Err(TransferError::ConfigInvalid("root_folder must be set".into()));
        }
        if self.packet_update_interval_ms == 0 {
            return Err(TransferError::ConfigInvalid(
                "packet_update_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Receiver-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Pass-phrase for `mcs://` transfers; ignored for `mc://`.
    pub passphrase: String,
    pub passphrase_encoding: PassphraseEncoding,
    /// UDP receive buffer request for the group socket.
    pub multicast_buffer_size: usize,
    pub read_timeout_secs: u64,
    /// Multicast TTL for anything the receiver emits on the group.
    pub ttl: u32,
    /// Directory received payloads land beneath.
    pub root_folder: PathBuf,
    pub reconnect_delay_secs: u64,
    pub packet_update_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            passphrase: String::new(),
            passphrase_encoding: PassphraseEncoding::default(),
            multicast_buffer_size: 4 * 1024 * 1024,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            ttl: 1,
            root_folder: PathBuf::from("."),
            reconnect_delay_secs: 30,
            packet_update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
        }
    }
}

impl ClientConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn packet_update_interval(&self) -> Duration {
        Duration::from_millis(self.packet_update_interval_ms)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.root_folder.as_os_str().is_empty() {
            return Err(TransferError::ConfigInvalid("root_folder must be set".into()));
        }
        if self.packet_update_interval_ms == 0 {
            return Err(TransferError::ConfigInvalid(
                "packet_update_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// The two halves as they appear in one config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

impl CascadeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CascadeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CASCADE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CascadeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CASCADE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CASCADE_SERVER__BIND_ADDRESS") {
            self.server.bind_address = v;
        }
        if let Ok(v) = std::env::var("CASCADE_SERVER__ROOT_FOLDER") {
            self.server.root_folder = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CASCADE_SERVER__PASSPHRASE") {
            self.server.passphrase = v;
        }
        if let Ok(v) = std::env::var("CASCADE_SERVER__MTU") {
            if let Ok(mtu) = v.parse() {
                self.server.mtu = mtu;
            }
        }
        if let Ok(v) = std::env::var("CASCADE_CLIENT__ROOT_FOLDER") {
            self.client.root_folder = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CASCADE_CLIENT__PASSPHRASE") {
            self.client.passphrase = v;
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("cascade")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
