//! Gateway service configuration.
//!
//! Stored as TOML at `$TETHER_GATEWAY_CONFIG`, or by default:
//! - Linux: `~/.config/tether/gateway.toml`
//! - Windows: `%APPDATA%/tether/gateway.toml`

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use tether_gateway::GatewayConfig;
use tether_protocol::constants::MAX_RESUBSCRIBE_BATCH;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "TETHER_GATEWAY_CONFIG";

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node name used in logs (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,

    #[serde(default = "default_max_resubscribe_batch")]
    pub max_resubscribe_batch: usize,

    /// Broadcasts parked while the fabric is down.
    #[serde(default = "default_retry_capacity")]
    pub retry_capacity: usize,

    #[serde(default = "default_retry_ttl_ms")]
    pub retry_ttl_ms: u64,

    /// Accepted credentials: token -> user id.
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "tether-gateway".into())
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8765
}

fn default_ping_interval_ms() -> u64 {
    20_000
}

fn default_pong_timeout_ms() -> u64 {
    30_000
}

fn default_max_resubscribe_batch() -> usize {
    MAX_RESUBSCRIBE_BATCH
}

fn default_retry_capacity() -> usize {
    tether_gateway::retry_queue::DEFAULT_RETRY_CAPACITY
}

fn default_retry_ttl_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            max_resubscribe_batch: default_max_resubscribe_batch(),
            retry_capacity: default_retry_capacity(),
            retry_ttl_ms: default_retry_ttl_ms(),
            tokens: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    /// Returns the path it used.
    pub fn load() -> anyhow::Result<(Self, PathBuf)> {
        let path = config_path()?;
        let config = Self::load_from(&path)?;
        Ok((config, path))
    }

    /// Like [`load`](Self::load) for an explicit path. A fresh file gets
    /// one randomly generated development token.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            return Ok(config);
        }

        let mut config = Config::default();
        let token = uuid::Uuid::new_v4().simple().to_string();
        config.tokens.insert(token, "dev".into());
        config.save_to(path)?;
        tracing::info!(path = %path.display(), "wrote default configuration");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Tokens live in this file.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Converts to the library's tuning struct.
    pub fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let host: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("invalid host address {:?}", self.host))?;
        Ok(GatewayConfig {
            host,
            port: self.port,
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
            max_resubscribe_batch: self.max_resubscribe_batch,
            retry_ttl: Duration::from_millis(self.retry_ttl_ms),
            ..GatewayConfig::default()
        })
    }
}

/// Returns the configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("tether")
            .join("gateway.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("tether").join("gateway.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/tether/gateway.toml"))
    }
}
