//! Dashboard configuration loading.
//!
//! TOML is the sole config source. A missing file is not an error — every
//! field has a default — but a file that exists and fails to parse is.
//!
//! ```toml
//! [server]
//! addr = "0.0.0.0:8080"
//! upstream_addr = "127.0.0.1:5555"
//! db_path = "data/dashboard.db"
//!
//! [reflector]
//! name = "URF Dashboard"
//! description = "Universal Reflector Dashboard"
//!
//! [history]
//! limit = 50
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub server: ServerConfig,
    pub reflector: ReflectorConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP/WebSocket bind address.
    pub addr: String,
    /// Telemetry publisher address (TCP, one JSON document per line).
    pub upstream_addr: String,
    pub db_path: String,
}

/// Reflector identity, echoed by `/api/config` for the UI header.
#[derive(Debug, Clone, Serialize)]
pub struct ReflectorConfig {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Records returned by `/api/history`.
    pub limit: u32,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    reflector: Option<RawReflectorConfig>,
    history: Option<RawHistoryConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    addr: Option<String>,
    upstream_addr: Option<String>,
    db_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReflectorConfig {
    name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHistoryConfig {
    limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from `path`; a file that does not exist yields the defaults.
pub fn load_config_from_path(path: &Path) -> Result<DashboardConfig, ConfigError> {
    if !path.exists() {
        return load_config_from_str("");
    }
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<DashboardConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let server = {
        let raw = raw.server.unwrap_or(RawServerConfig {
            addr: None,
            upstream_addr: None,
            db_path: None,
        });
        ServerConfig {
            addr: raw.addr.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
            upstream_addr: raw
                .upstream_addr
                .unwrap_or_else(|| "127.0.0.1:5555".to_owned()),
            db_path: raw.db_path.unwrap_or_else(|| "data/dashboard.db".to_owned()),
        }
    };
    if server.addr.is_empty() {
        return Err(ConfigError::InvalidValue(
            "server.addr must not be empty".to_owned(),
        ));
    }
    if server.upstream_addr.is_empty() {
        return Err(ConfigError::InvalidValue(
            "server.upstream_addr must not be empty".to_owned(),
        ));
    }

    let reflector = {
        let raw = raw.reflector.unwrap_or(RawReflectorConfig {
            name: None,
            description: None,
        });
        ReflectorConfig {
            name: raw.name.unwrap_or_else(|| "URF Dashboard".to_owned()),
            description: raw
                .description
                .unwrap_or_else(|| "Universal Reflector Dashboard".to_owned()),
        }
    };

    let limit = raw.history.and_then(|h| h.limit).unwrap_or(50);
    if limit == 0 {
        return Err(ConfigError::InvalidValue(
            "history.limit must be at least 1".to_owned(),
        ));
    }

    Ok(DashboardConfig {
        server,
        reflector,
        history: HistoryConfig { limit },
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
