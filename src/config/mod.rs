//! Configuration management for the scrubber control plane.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `SCRUBBER__*` environment variables (double underscore between sections).

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

pub use crate::models::{
    CollectorConfig, DataPlaneBackend, DataPlaneConfig, MetricsConfig, NotifierConfig, RedisConfig,
    ServerConfig,
};

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("redis.key_prefix", "scrubber")?
        .set_default("data_plane.backend", "memory")?
        .set_default("collector.interval_ms", 1000)?
        .set_default("notifier.source", "scrubber-control")?
        .set_default("notifier.timeout_seconds", 5)?
        .set_default("metrics.enabled", true)?
        .set_default("metrics.listen", "127.0.0.1:9100")?
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::with_prefix("SCRUBBER").separator("__"))
        .build()?;

    let config: Config = config.try_deserialize()?;
    validate(&config)?;
    Ok(config)
}

/// Reject settings the engines cannot run with
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let alpha = config.baseline.alpha;
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(ConfigError::Message(format!(
            "baseline.alpha must be in (0, 1), got {}",
            alpha
        )));
    }
    if config.escalation.hysteresis_count == 0 {
        return Err(ConfigError::Message(
            "escalation.hysteresis_count must be at least 1".to_string(),
        ));
    }
    if config.escalation.max_history == 0 {
        return Err(ConfigError::Message(
            "escalation.max_history must be at least 1".to_string(),
        ));
    }
    if config.collector.interval_ms == 0 {
        return Err(ConfigError::Message(
            "collector.interval_ms must be positive".to_string(),
        ));
    }
    Ok(())
}
