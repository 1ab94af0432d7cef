//! Interfaces to the packet-filtering data plane.
//!
//! The control plane talks to the data plane through two narrow seams: a
//! key/value configuration map that the filter program reads on every packet,
//! and a statistics source exposing its cumulative counters. Both are traits
//! so the engines can be driven against an in-process fake or a Redis mirror
//! of the kernel maps.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::utils::format_map_key;

/// Configuration map key ids shared with the filter program.
///
/// Only the keys the control plane writes are listed; the filter program
/// owns the rest of the key space.
pub mod keys {
    pub const BASELINE_PPS: u32 = 8;
    pub const BASELINE_BPS: u32 = 9;
    pub const ESCALATION_LEVEL: u32 = 16;
}

/// Errors that can occur while writing or reading the configuration map
#[derive(Error, Debug)]
pub enum ConfigMapError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("config map unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur while reading data plane counters
#[derive(Error, Debug)]
pub enum StatsSourceError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("failed to decode counters: {0}")]
    DecodeError(String),
    #[error("stats source unavailable: {0}")]
    Unavailable(String),
}

/// Cumulative counters reported by the data plane.
///
/// Everything except `reputation_blocked` only ever grows while the filter
/// program stays loaded. `reputation_blocked` is a gauge: the number of
/// sources currently auto-blocked by reputation scoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub dropped_packets: u64,
    pub dropped_bytes: u64,
    pub syn_flood_dropped: u64,
    pub udp_flood_dropped: u64,
    pub icmp_flood_dropped: u64,
    pub ack_flood_dropped: u64,
    pub reputation_blocked: u64,
}

/// Shared key/value map consumed by the filter program.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigMap: Send + Sync {
    /// Insert or overwrite `key` with `value`.
    fn update(&self, key: u32, value: u64) -> BoxFuture<'static, Result<(), ConfigMapError>>;

    fn lookup(&self, key: u32) -> BoxFuture<'static, Result<Option<u64>, ConfigMapError>>;
}

/// Source of the data plane's cumulative counters.
pub trait StatsSource: Send + Sync {
    fn read_stats(&self) -> BoxFuture<'static, Result<GlobalStats, StatsSourceError>>;
}

/// In-process data plane used for dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryDataPlane {
    config: Arc<Mutex<HashMap<u32, u64>>>,
    stats: Arc<Mutex<GlobalStats>>,
}

impl MemoryDataPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the counters returned by the next `read_stats` call
    pub async fn set_stats(&self, stats: GlobalStats) {
        *self.stats.lock().await = stats;
    }

    /// Snapshot of every key written so far
    pub async fn config_entries(&self) -> HashMap<u32, u64> {
        self.config.lock().await.clone()
    }
}

impl ConfigMap for MemoryDataPlane {
    fn update(&self, key: u32, value: u64) -> BoxFuture<'static, Result<(), ConfigMapError>> {
        let config = self.config.clone();
        Box::pin(async move {
            config.lock().await.insert(key, value);
            Ok(())
        })
    }

    fn lookup(&self, key: u32) -> BoxFuture<'static, Result<Option<u64>, ConfigMapError>> {
        let config = self.config.clone();
        Box::pin(async move { Ok(config.lock().await.get(&key).copied()) })
    }
}

impl StatsSource for MemoryDataPlane {
    fn read_stats(&self) -> BoxFuture<'static, Result<GlobalStats, StatsSourceError>> {
        let stats = self.stats.clone();
        Box::pin(async move { Ok(*stats.lock().await) })
    }
}

/// Data plane whose maps are mirrored into Redis hashes by a node-local agent.
///
/// Configuration lives in `<prefix>:config` keyed by the numeric map key,
/// counters in `<prefix>:stats` keyed by counter name.
#[derive(Clone)]
pub struct RedisDataPlane {
    conn: ConnectionManager,
    config_key: String,
    stats_key: String,
}

impl RedisDataPlane {
    /// Connect to Redis and build a data plane handle
    pub async fn connect(client: redis::Client, prefix: &str) -> Result<Self, ConfigMapError> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            config_key: format_map_key(prefix, "config"),
            stats_key: format_map_key(prefix, "stats"),
        })
    }
}

impl ConfigMap for RedisDataPlane {
    fn update(&self, key: u32, value: u64) -> BoxFuture<'static, Result<(), ConfigMapError>> {
        let mut conn = self.conn.clone();
        let hash = self.config_key.clone();
        Box::pin(async move {
            conn.hset::<_, _, _, ()>(hash, key, value).await?;
            Ok(())
        })
    }

    fn lookup(&self, key: u32) -> BoxFuture<'static, Result<Option<u64>, ConfigMapError>> {
        let mut conn = self.conn.clone();
        let hash = self.config_key.clone();
        Box::pin(async move {
            let value: Option<u64> = conn.hget(hash, key).await?;
            Ok(value)
        })
    }
}

impl StatsSource for RedisDataPlane {
    fn read_stats(&self) -> BoxFuture<'static, Result<GlobalStats, StatsSourceError>> {
        let mut conn = self.conn.clone();
        let hash = self.stats_key.clone();
        Box::pin(async move {
            let fields: HashMap<String, u64> = conn.hgetall(hash).await?;
            if fields.is_empty() {
                return Err(StatsSourceError::Unavailable(
                    "no counters published yet".to_string(),
                ));
            }
            decode_counters(fields)
        })
    }
}

/// Build `GlobalStats` from a name -> value field map, ignoring unknown names
fn decode_counters(fields: HashMap<String, u64>) -> Result<GlobalStats, StatsSourceError> {
    let value = serde_json::to_value(fields)
        .map_err(|e| StatsSourceError::DecodeError(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| StatsSourceError::DecodeError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_config_map_upserts() {
        let plane = MemoryDataPlane::new();

        plane.update(keys::ESCALATION_LEVEL, 1).await.unwrap();
        plane.update(keys::ESCALATION_LEVEL, 3).await.unwrap();

        assert_eq!(plane.lookup(keys::ESCALATION_LEVEL).await.unwrap(), Some(3));
        assert_eq!(plane.lookup(keys::BASELINE_PPS).await.unwrap(), None);
        assert_eq!(plane.config_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_stats_source_returns_latest_counters() {
        let plane = MemoryDataPlane::new();
        assert_eq!(plane.read_stats().await.unwrap(), GlobalStats::default());

        plane
            .set_stats(GlobalStats {
                rx_packets: 42,
                ..Default::default()
            })
            .await;
        assert_eq!(plane.read_stats().await.unwrap().rx_packets, 42);
    }

    #[test]
    fn test_decode_counters_ignores_unknown_fields() {
        let mut fields = HashMap::new();
        fields.insert("rx_packets".to_string(), 1000);
        fields.insert("dropped_bytes".to_string(), 77);
        fields.insert("conntrack_new".to_string(), 5);

        let stats = decode_counters(fields).unwrap();
        assert_eq!(stats.rx_packets, 1000);
        assert_eq!(stats.dropped_bytes, 77);
        assert_eq!(stats.tx_packets, 0);
    }
}
