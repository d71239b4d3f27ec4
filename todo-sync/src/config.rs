//! Server configuration, with environment overrides.
//!
//! | Variable            | Default          |
//! |---------------------|------------------|
//! | `BIND_ADDR`         | `127.0.0.1:3000` |
//! | `CACHE_ADAPTER`     | `memory`         |
//! | `REDIS_HOST`        | `localhost`      |
//! | `REDIS_PORT`        | `6379`           |
//! | `CACHE_TTL_SECS`    | `600`            |
//! | `STORAGE_PATH`      | unset (memory)   |
//! | `OUTBOUND_CAPACITY` | `256`            |

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::cache::redis::redis_url;
use crate::cache::DEFAULT_TTL_SECS;
use crate::connection::DEFAULT_OUTBOUND_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Which cache backend to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis { host: String, port: u16 },
}

impl CacheBackend {
    pub fn redis_url(&self) -> Option<String> {
        match self {
            CacheBackend::Memory => None,
            CacheBackend::Redis { host, port } => Some(redis_url(host, *port)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Entry lifetime in seconds
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StorageConfig {
    /// Lost on restart
    #[default]
    Memory,
    Rocks { path: PathBuf },
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-connection outbound queue depth
    pub outbound_capacity: usize,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Defaults overridden by `vars`. Empty values count as unset.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(addr) = get("BIND_ADDR") {
            config.bind_addr = addr.to_string();
        }
        if let Some(capacity) = get("OUTBOUND_CAPACITY") {
            config.outbound_capacity = parse("OUTBOUND_CAPACITY", capacity)?;
            if config.outbound_capacity == 0 {
                return Err(invalid("OUTBOUND_CAPACITY", capacity));
            }
        }
        if let Some(ttl) = get("CACHE_TTL_SECS") {
            config.cache.ttl_secs = parse("CACHE_TTL_SECS", ttl)?;
        }

        match get("CACHE_ADAPTER").map(str::to_ascii_lowercase).as_deref() {
            None | Some("memory") => {}
            Some("redis") => {
                let host = get("REDIS_HOST").unwrap_or("localhost").to_string();
                let port = match get("REDIS_PORT") {
                    Some(port) => parse("REDIS_PORT", port)?,
                    None => 6379,
                };
                config.cache.backend = CacheBackend::Redis { host, port };
            }
            Some(other) => return Err(invalid("CACHE_ADAPTER", other)),
        }

        if let Some(path) = get("STORAGE_PATH") {
            config.storage = StorageConfig::Rocks {
                path: PathBuf::from(path),
            };
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(name, value))
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
    }
}
