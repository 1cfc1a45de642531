//! Redis key-value store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::traits::KeyValueStore;

const DEFAULT_SCAN_COUNT: usize = 250;

/// [`KeyValueStore`] backed by a Redis connection manager.
///
/// Pattern lookups use `SCAN MATCH` rather than `KEYS` so large keyspaces
/// are walked incrementally.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    connection: ConnectionManager,
    timeout: Duration,
    scan_count: usize,
}

impl RedisKeyValueStore {
    pub fn new(connection: ConnectionManager, timeout: Duration) -> Self {
        Self {
            connection,
            timeout,
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }

    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let connection = timed(config.redis_timeout, "connect", client.get_connection_manager()).await?;
        debug!("Connected to Redis at {}", config.redis_url);
        Ok(Self::new(connection, config.redis_timeout))
    }

    /// Keys requested per `SCAN` round trip.
    pub fn with_scan_count(mut self, count: usize) -> Self {
        self.scan_count = count.max(1);
        self
    }
}

/// `SET key value PX ttl`, at millisecond precision so sub-second TTLs are
/// not truncated.
fn set_command(key: &str, value: &str, ttl: Duration) -> redis::Cmd {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value).arg("PX").arg(millis);
    cmd
}

async fn timed<T>(
    timeout: Duration,
    operation: &str,
    future: impl Future<Output = RedisResult<T>>,
) -> StoreResult<T> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Timeout(format!("redis {operation}"))),
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut connection = self.connection.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        timed(self.timeout, "GET", cmd.query_async(&mut connection)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut connection = self.connection.clone();
        let cmd = set_command(key, value, ttl);
        timed(self.timeout, "SET", cmd.query_async(&mut connection)).await
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut connection = self.connection.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        timed(self.timeout, "DEL", cmd.query_async(&mut connection)).await
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut connection = self.connection.clone();
        let mut found = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_count);
            let (next, batch): (u64, Vec<String>) =
                timed(self.timeout, "SCAN", cmd.query_async(&mut connection)).await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        found.sort();
        found.dedup();
        Ok(found)
    }
}
