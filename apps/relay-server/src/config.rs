//! Server configuration management.
//!
//! Configuration is stored as TOML, read from `$CHATRELAY_CONFIG` when set,
//! otherwise from:
//! - Linux: `~/.config/chatrelay/server.toml`
//! - Windows: `%APPDATA%/chatrelay/server.toml`

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chatrelay_hub::{HubConfig, PeerConfig, ServerConfig};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the configuration file location.
const CONFIG_ENV: &str = "CHATRELAY_CONFIG";

/// Relay server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind the listener to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,

    /// Largest accepted text frame in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Seconds a connection may stay silent before it is dropped.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Seconds a single frame write may take.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Seconds between transport pings.
    #[serde(default = "default_ping_period")]
    pub ping_period_secs: u64,

    /// Delay before the roster is rebroadcast after a login.
    #[serde(default = "default_roster_delay")]
    pub roster_delay_ms: u64,

    /// Delay of the follow-up roster rebroadcast.
    #[serde(default = "default_resync_delay")]
    pub resync_delay_ms: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    ServerConfig::default().port
}

fn default_send_buffer_size() -> usize {
    PeerConfig::default().send_buffer_size
}

fn default_max_message_size() -> usize {
    PeerConfig::default().max_message_size
}

fn default_read_timeout() -> u64 {
    PeerConfig::default().read_timeout.as_secs()
}

fn default_write_timeout() -> u64 {
    PeerConfig::default().write_timeout.as_secs()
}

fn default_ping_period() -> u64 {
    PeerConfig::default().ping_period.as_secs()
}

fn default_roster_delay() -> u64 {
    HubConfig::default().roster_delay.as_millis() as u64
}

fn default_resync_delay() -> u64 {
    HubConfig::default().resync_delay.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            send_buffer_size: default_send_buffer_size(),
            max_message_size: default_max_message_size(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            ping_period_secs: default_ping_period(),
            roster_delay_ms: default_roster_delay(),
            resync_delay_ms: default_resync_delay(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    /// Loads configuration from `path`, writing defaults there if absent.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Builds the listener settings.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let bind_addr: IpAddr = self
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind_address {:?}", self.bind_address))?;
        Ok(ServerConfig {
            bind_addr,
            port: self.port,
            peer: self.peer_config(),
        })
    }

    /// Builds the per-connection settings.
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            send_buffer_size: self.send_buffer_size.max(1),
            read_timeout: Duration::from_secs(self.read_timeout_secs.max(1)),
            write_timeout: Duration::from_secs(self.write_timeout_secs.max(1)),
            ping_period: Duration::from_secs(self.ping_period_secs.max(1)),
            max_message_size: self.max_message_size,
        }
    }

    /// Builds the hub settings.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            roster_delay: Duration::from_millis(self.roster_delay_ms),
            resync_delay: Duration::from_millis(self.resync_delay_ms),
            ..HubConfig::default()
        }
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    path_or_default(std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

fn path_or_default(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return path;
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("chatrelay").join("server.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("chatrelay")
            .join("server.toml")
    }
}
