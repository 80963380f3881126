//! Bootstrap configuration loading
//!
//! Configuration is read once at startup from a TOML file. The file location is
//! resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. `LBO_CONFIG` environment variable
//! 3. User config directory (`~/.config/lbo/lbo-server.toml` on Linux)
//! 4. Built-in defaults (no file)
//!
//! Every field has a built-in default, so a partial file (or no file at all)
//! yields a complete configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "LBO_CONFIG";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
    pub pacing: PacingConfig,
    pub connections: ConnectionConfig,
    pub classifier: ClassifierConfig,
}

/// HTTP listener and database location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address, e.g. "127.0.0.1:8000"
    pub bind: String,
    /// Path to the SQLite database file
    pub database_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            database_path: default_data_dir().join("batches.db"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Batch store tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound on retrying a write that hit SQLite lock contention
    pub max_lock_wait_ms: u64,
    /// Capacity of the store mutation bus
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_lock_wait_ms: 5000,
            event_capacity: 1024,
        }
    }
}

/// Chunk dispatcher tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Items per chunk
    pub chunk_size: usize,
    /// Global cap on in-flight classification calls; None = min(4, cores)
    pub max_concurrency: Option<usize>,
    /// Attempts per item before it is recorded invalid
    pub item_max_attempts: u32,
    /// Pause between attempts of the same item, per retry (milliseconds)
    pub item_backoff_ms: Vec<u64>,
    /// Per-attempt classification timeout
    pub classify_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            max_concurrency: None,
            item_max_attempts: 3,
            item_backoff_ms: Vec::new(),
            classify_timeout_secs: 60,
        }
    }
}

/// Inter-chunk pacing constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub base_secs: f64,
    /// Dominant weight (k1)
    pub major_weight: f64,
    /// Minor weight (k2)
    pub minor_weight: f64,
    /// Batches at or above this size throttle by volume
    pub size_threshold: u64,
    /// Floor of `batch_size * floor_per_item` seconds
    pub floor_per_item: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            base_secs: 3.0,
            major_weight: 0.2,
            minor_weight: 0.05,
            size_threshold: 100,
            floor_per_item: 0.1,
        }
    }
}

/// Connection registry timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    /// How long subscriptions outlive a dropped connection
    pub idle_ceiling_secs: u64,
    pub max_reconnect_attempts: u32,
    /// Outbound messages buffered per connection before pushes are dropped
    pub outbound_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            idle_ceiling_secs: 300,
            max_reconnect_attempts: 5,
            outbound_buffer: 64,
        }
    }
}

/// Classification service endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub base_url: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
        }
    }
}

impl TomlConfig {
    /// Resolve the config file location and load it, falling back to defaults
    pub fn load(cli_arg: Option<&Path>) -> Result<Self> {
        Self::from_source(resolve_config_path(cli_arg).as_deref())
    }

    /// Load an already resolved location; `None` means built-in defaults
    ///
    /// Logs nothing, so it can run before the tracing subscriber exists.
    pub fn from_source(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => load_toml_config(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.chunk_size == 0 {
            return Err(Error::Config("dispatch.chunk_size must be at least 1".to_string()));
        }
        if self.dispatch.item_max_attempts == 0 {
            return Err(Error::Config(
                "dispatch.item_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.dispatch.max_concurrency == Some(0) {
            return Err(Error::Config(
                "dispatch.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.pacing.major_weight <= self.pacing.minor_weight {
            return Err(Error::Config(
                "pacing.major_weight must exceed pacing.minor_weight".to_string(),
            ));
        }
        if self.connections.ping_interval_secs == 0 || self.connections.outbound_buffer == 0 {
            return Err(Error::Config(
                "connections.ping_interval_secs and outbound_buffer must be non-zero".to_string(),
            ));
        }
        if self.store.event_capacity == 0 {
            return Err(Error::Config("store.event_capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// Config file resolution: CLI argument → environment → user config dir
///
/// A CLI or environment path is returned even if it does not exist, so the
/// subsequent read reports the misconfiguration instead of silently using defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory (only if present)
    let user_config = dirs::config_dir().map(|d| d.join("lbo").join("lbo-server.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
        debug!("No user config at {}", path.display());
    }

    None
}

/// OS-dependent default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("lbo"))
        .unwrap_or_else(|| PathBuf::from("./lbo_data"))
}
