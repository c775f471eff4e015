//! Configuration resolution for Tether.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config_dir>/tether/tether.toml`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`TETHER_*`)
//!
//! Files are merged table by table, so an explicit file only needs to name the
//! keys it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Tether configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub pump: PumpSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub log: LogSection,
}

/// Where the tunnel goes and how to authenticate the SSH hop.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelSection {
    /// Host of the remote service, as seen from the SSH server.
    pub service_host: String,
    pub service_port: u16,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    /// Pinned server key, `SHA256:<base64>` as printed by `ssh-keygen -l`.
    pub host_key_fingerprint: Option<String>,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            service_host: "127.0.0.1".to_string(),
            service_port: 9000,
            ssh_host: "localhost".to_string(),
            ssh_port: 22,
            username: std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
            password: None,
            key_path: None,
            passphrase: None,
            host_key_fingerprint: None,
        }
    }
}

impl std::fmt::Debug for TunnelSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSection")
            .field("service_host", &self.service_host)
            .field("service_port", &self.service_port)
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish()
    }
}

/// Message channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelSection {
    /// How long I/O waits for the channel to become connected.
    pub connect_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            max_frame_bytes: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// Stream pump settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PumpSection {
    pub buffer_size: usize,
    /// Seconds between SSH keepalive probes.
    pub keepalive_interval_secs: u64,
    /// Missed keepalives before the session is declared lost.
    pub keepalive_max: u32,
    pub ssh_connect_timeout_secs: u64,
}

impl Default for PumpSection {
    fn default() -> Self {
        Self {
            buffer_size: 30_000,
            keepalive_interval_secs: 15,
            keepalive_max: 3,
            ssh_connect_timeout_secs: 10,
        }
    }
}

/// Reconnection backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Also reconnect when the peer closes the channel cleanly.
    pub reconnect_on_close: bool,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: None,
            reconnect_on_close: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub json: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = toml::Table::new();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_tables(&mut merged, load_table(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        merge_tables(&mut merged, load_table(path)?);
    }

    let mut config: Config = toml::Value::Table(merged).try_into()?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tether").join("tether.toml"))
}

fn load_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    content.parse::<toml::Table>().map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("TETHER_SERVICE_HOST") {
        config.tunnel.service_host = val;
    }
    if let Some(n) = lookup("TETHER_SERVICE_PORT").and_then(|v| v.parse().ok()) {
        config.tunnel.service_port = n;
    }
    if let Some(val) = lookup("TETHER_SSH_HOST") {
        config.tunnel.ssh_host = val;
    }
    if let Some(n) = lookup("TETHER_SSH_PORT").and_then(|v| v.parse().ok()) {
        config.tunnel.ssh_port = n;
    }
    if let Some(val) = lookup("TETHER_SSH_USER") {
        config.tunnel.username = val;
    }
    if let Some(val) = lookup("TETHER_SSH_PASSWORD") {
        config.tunnel.password = Some(val);
    }
    if let Some(val) = lookup("TETHER_SSH_KEY") {
        config.tunnel.key_path = Some(PathBuf::from(val));
    }
    if let Some(n) = lookup("TETHER_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.channel.connect_timeout_ms = n;
    }
    if let Some(val) = lookup("TETHER_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = lookup("TETHER_LOG_JSON") {
        config.log.json = matches!(val.as_str(), "1" | "true" | "yes");
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.pump.buffer_size == 0 {
        return Err(Error::Config("pump.buffer_size must be positive".into()));
    }
    if config.reconnect.multiplier < 1.0 {
        return Err(Error::Config(format!(
            "reconnect.multiplier must be >= 1.0, got {}",
            config.reconnect.multiplier
        )));
    }
    if config.tunnel.password.is_some() && config.tunnel.key_path.is_some() {
        return Err(Error::Config(
            "tunnel.password and tunnel.key_path are mutually exclusive".into(),
        ));
    }
    Ok(())
}
