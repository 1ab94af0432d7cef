use serde::{Deserialize, Serialize};

use crate::core::{BaselineConfig, EscalationConfig};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix of the hashes mirroring the data plane maps
    pub key_prefix: String,
}

/// Which data plane transport to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataPlaneBackend {
    /// In-process maps, nothing leaves the control plane
    Memory,
    /// Maps mirrored through Redis
    Redis,
}

/// Data plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPlaneConfig {
    pub backend: DataPlaneBackend,
}

/// Stats collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Poll interval in milliseconds
    pub interval_ms: u64,
}

/// Alert webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Endpoint receiving level change notices; disabled when unset
    pub webhook_url: Option<String>,
    /// Instance name included in notices
    pub source: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to expose metrics
    pub enabled: bool,
    /// Listen address of the exporter
    pub listen: String,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Data plane configuration
    pub data_plane: DataPlaneConfig,
    /// Stats collector configuration
    pub collector: CollectorConfig,
    /// Baseline engine configuration
    #[serde(default)]
    pub baseline: BaselineConfig,
    /// Escalation engine configuration
    #[serde(default)]
    pub escalation: EscalationConfig,
    /// Alert webhook configuration
    pub notifier: NotifierConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                key_prefix: "scrubber".to_string(),
            },
            data_plane: DataPlaneConfig {
                backend: DataPlaneBackend::Memory,
            },
            collector: CollectorConfig { interval_ms: 1000 },
            baseline: BaselineConfig::default(),
            escalation: EscalationConfig::default(),
            notifier: NotifierConfig {
                webhook_url: None,
                source: "scrubber-control".to_string(),
                timeout_seconds: 5,
            },
            metrics: MetricsConfig {
                enabled: true,
                listen: "127.0.0.1:9100".to_string(),
            },
        }
    }
}
