//! Scrubber control plane
//!
//! This is the main entry point for the control plane.
//! It connects to the data plane, starts the defense loop and serves the
//! admin API until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use redis::Client;
use tokio::sync::watch;

use scrubber_control::api::{self, ApiState};
use scrubber_control::config::{self, DataPlaneBackend};
use scrubber_control::core::{
    Baseline, ConfigMap, DefensePipeline, EscalationEngine, MemoryDataPlane, RedisDataPlane,
    StatsCollector, StatsSource, WebhookNotifier,
};
use scrubber_control::models::Config;
use scrubber_control::utils::forward_ctrl_c;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting scrubber control plane...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;

    if config.metrics.enabled {
        let addr: SocketAddr = config
            .metrics
            .listen
            .parse()
            .with_context(|| format!("Invalid metrics listen address {}", config.metrics.listen))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus exporter listening on {}", addr);
    }

    let (config_map, stats_source) = connect_data_plane(&config).await?;

    // Initialize engines
    let collector = Arc::new(StatsCollector::new(
        stats_source,
        Duration::from_millis(config.collector.interval_ms),
    ));
    let baseline = Arc::new(Baseline::new(config_map.clone(), config.baseline.clone()));
    let escalation = Arc::new(EscalationEngine::new(config_map, config.escalation.clone()));

    if let Some(url) = config.notifier.webhook_url.clone() {
        let notifier = WebhookNotifier::new(
            url,
            config.notifier.source.clone(),
            Duration::from_secs(config.notifier.timeout_seconds),
        )
        .context("Failed to build webhook notifier")?;
        Arc::new(notifier).attach(&escalation).await;
    }

    escalation
        .start()
        .await
        .context("Failed to push initial escalation level")?;

    // Start background loops
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = Arc::new(DefensePipeline::new(
        collector.clone(),
        baseline.clone(),
        escalation.clone(),
        Duration::from_secs(config.escalation.evaluation_interval_seconds.max(1)),
    ));
    // Subscribe before the first poll so no snapshot is missed
    let snapshots = pipeline.subscribe().await;
    let pipeline_task = {
        let pipeline = pipeline.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { pipeline.run(snapshots, shutdown).await })
    };
    let collector_task = {
        let collector = collector.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { collector.run(shutdown).await })
    };
    let baseline_task = baseline.start(shutdown_rx);
    let signal_task = tokio::spawn(forward_ctrl_c(shutdown_tx));

    // Create API state
    let state = web::Data::new(ApiState {
        collector,
        baseline,
        escalation,
    });

    info!(
        "Admin API listening on {}:{}",
        config.server.host, config.server.port
    );

    // Start HTTP server
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))?
        .run()
        .await?;

    // Dropping the sender stops the loops even if no signal arrived
    signal_task.abort();
    for (name, task) in [
        ("collector", collector_task),
        ("pipeline", pipeline_task),
        ("baseline", baseline_task),
    ] {
        match tokio::time::timeout(Duration::from_secs(5), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} task failed: {}", name, e),
            Err(_) => warn!("{} task did not stop in time", name),
        }
    }

    info!("Scrubber control plane stopped");
    Ok(())
}

/// Build the configuration map and stats source for the configured backend
async fn connect_data_plane(
    config: &Config,
) -> anyhow::Result<(Arc<dyn ConfigMap>, Arc<dyn StatsSource>)> {
    match config.data_plane.backend {
        DataPlaneBackend::Memory => {
            warn!("Using in-memory data plane, nothing will be enforced");
            let plane = MemoryDataPlane::new();
            Ok((Arc::new(plane.clone()), Arc::new(plane)))
        }
        DataPlaneBackend::Redis => {
            // Initialize Redis client
            let client = Client::open(config.redis.url.as_str())
                .context("Failed to create Redis client")?;
            let plane = RedisDataPlane::connect(client, &config.redis.key_prefix)
                .await
                .context("Failed to connect to Redis")?;
            info!(
                "Using Redis data plane at {} (prefix: {})",
                config.redis.url, config.redis.key_prefix
            );
            Ok((Arc::new(plane.clone()), Arc::new(plane)))
        }
    }
}
