//! Shared networked cache backend (Redis).
//!
//! Same semantics as [`super::MemoryCache`]: TTL in seconds via `SETEX`,
//! `GET` for reads and `DEL` for invalidation.

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;

use super::{CacheAdapter, CacheError};

impl From<::redis::RedisError> for CacheError {
    fn from(e: ::redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// Redis URL from host and port.
pub fn redis_url(host: &str, port: u16) -> String {
    format!("redis://{host}:{port}/")
}

/// Cache backend talking to Redis through a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        log::info!("Connected to redis cache at {url}");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheAdapter for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl_secs: Option<u64>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl_secs {
            Some(secs) if secs > 0 => conn.set_ex::<_, _, ()>(key, value, secs).await?,
            _ => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
