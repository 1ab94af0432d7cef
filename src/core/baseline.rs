//! Traffic baseline learning and anomaly scoring.
//!
//! Normal traffic is modelled with an exponentially weighted moving average
//! of the mean and variance of packets/s, bits/s and dropped packets/s. The
//! state is O(1) per metric and slowly forgets old history. Once the learning
//! period is over the learned means are pushed to the data plane and samples
//! are flagged when their Z-score leaves the configured band.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::core::data_plane::{keys, ConfigMap, ConfigMapError};

/// Standard deviations below this are treated as a flat signal
const MIN_STD_DEV: f64 = 1e-9;

/// Errors that can occur in the baseline engine
#[derive(Error, Debug)]
pub enum BaselineError {
    #[error("failed to write config key {key}: {source}")]
    ConfigMapError {
        key: u32,
        #[source]
        source: ConfigMapError,
    },
}

/// Baseline engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// EWMA smoothing factor, in (0, 1)
    pub alpha: f64,
    /// Z-score above which a sample is anomalous
    pub anomaly_z_threshold: f64,
    /// Samples required before the baseline is trusted
    pub learning_period: u64,
    /// Seconds between baseline pushes to the data plane
    pub push_interval_seconds: u64,
    /// Lowest baseline pps used when deriving adaptive rates
    pub min_baseline_pps: f64,
    pub syn_multiplier: f64,
    pub udp_multiplier: f64,
    pub icmp_multiplier: f64,
    pub global_multiplier: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            alpha: 0.01,
            anomaly_z_threshold: 3.0,
            learning_period: 300,
            push_interval_seconds: 10,
            min_baseline_pps: 100.0,
            syn_multiplier: 3.0,
            udp_multiplier: 2.0,
            icmp_multiplier: 5.0,
            global_multiplier: 2.0,
        }
    }
}

/// Baseline state and anomaly verdict for the latest sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub baseline_pps: f64,
    pub baseline_bps: f64,
    pub current_pps: f64,
    pub current_bps: f64,
    pub std_dev_pps: f64,
    pub std_dev_bps: f64,
    pub z_score_pps: f64,
    pub z_score_bps: f64,
    pub is_anomaly: bool,
    /// Larger of the pps and bps Z-scores
    pub anomaly_score: f64,
}

/// Rate ceilings recommended from the learned baseline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdaptiveRates {
    pub syn_pps: u64,
    pub udp_pps: u64,
    pub icmp_pps: u64,
    pub global_pps: u64,
}

/// Running mean and variance of a single metric
#[derive(Debug, Clone, Copy, Default)]
struct Ewma {
    mean: f64,
    variance: f64,
    current: f64,
}

impl Ewma {
    fn seed(&mut self, x: f64) {
        self.mean = x;
        self.variance = 0.0;
        self.current = x;
    }

    // mean' = a*x + (1-a)*mean ; var' = a*(x-mean')^2 + (1-a)*var
    fn update(&mut self, alpha: f64, x: f64) {
        let mean = alpha * x + (1.0 - alpha) * self.mean;
        let diff = x - mean;
        self.variance = alpha * diff * diff + (1.0 - alpha) * self.variance;
        self.mean = mean;
        self.current = x;
    }

    fn std_dev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    fn z_score(&self) -> f64 {
        z_score(self.current, self.mean, self.std_dev())
    }
}

fn z_score(value: f64, mean: f64, std_dev: f64) -> f64 {
    if std_dev < MIN_STD_DEV {
        return 0.0;
    }
    (value - mean) / std_dev
}

#[derive(Debug, Default)]
struct BaselineState {
    pps: Ewma,
    bps: Ewma,
    drop_pps: Ewma,
    sample_count: u64,
    last_push: Option<DateTime<Utc>>,
}

/// EWMA traffic baseline with anomaly detection
pub struct Baseline {
    config_map: Arc<dyn ConfigMap>,
    config: BaselineConfig,
    push_interval: Duration,
    state: RwLock<BaselineState>,
}

impl Baseline {
    /// Create a new baseline engine writing to `config_map`
    pub fn new(config_map: Arc<dyn ConfigMap>, config: BaselineConfig) -> Self {
        let push_interval = Duration::from_secs(config.push_interval_seconds.max(1));
        Self {
            config_map,
            config,
            push_interval,
            state: RwLock::new(BaselineState::default()),
        }
    }

    /// Override the push interval with sub-second precision
    pub fn with_push_interval(mut self, interval: Duration) -> Self {
        self.push_interval = interval;
        self
    }

    /// Spawn the loop that pushes the learned baseline to the data plane.
    ///
    /// Nothing is pushed until the learning period is complete.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(
            "Baseline engine started (alpha: {}, anomaly z threshold: {}, learning samples: {})",
            self.config.alpha, self.config.anomaly_z_threshold, self.config.learning_period
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + engine.push_interval, engine.push_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {
                        if engine.is_operational().await {
                            if let Err(e) = engine.update_config_map().await {
                                warn!("Failed to push baseline to data plane: {}", e);
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            info!("Baseline engine stopped");
        })
    }

    /// Ingest one rate sample, nominally once per second
    pub async fn feed(&self, pps: f64, bps: f64, drop_pps: f64) {
        let alpha = self.config.alpha;
        let mut state = self.state.write().await;
        state.sample_count += 1;

        if state.sample_count == 1 {
            state.pps.seed(pps);
            state.bps.seed(bps);
            state.drop_pps.seed(drop_pps);
            return;
        }

        state.pps.update(alpha, pps);
        state.bps.update(alpha, bps);
        state.drop_pps.update(alpha, drop_pps);
    }

    /// Compute the current baseline metrics and anomaly verdict
    pub async fn metrics(&self) -> Metrics {
        let state = self.state.read().await;

        let z_score_pps = state.pps.z_score();
        let z_score_bps = state.bps.z_score();
        let anomaly_score = z_score_pps.max(z_score_bps);
        let learning = state.sample_count < self.config.learning_period;

        Metrics {
            baseline_pps: state.pps.mean,
            baseline_bps: state.bps.mean,
            current_pps: state.pps.current,
            current_bps: state.bps.current,
            std_dev_pps: state.pps.std_dev(),
            std_dev_bps: state.bps.std_dev(),
            z_score_pps,
            z_score_bps,
            is_anomaly: !learning && anomaly_score > self.config.anomaly_z_threshold,
            anomaly_score,
        }
    }

    /// Recommended rate ceilings scaled from the learned pps mean
    pub async fn adaptive_rates(&self) -> AdaptiveRates {
        let mean_pps = self.state.read().await.pps.mean;
        let floor = self.config.min_baseline_pps;
        let base = mean_pps.max(floor);

        AdaptiveRates {
            syn_pps: (base * self.config.syn_multiplier) as u64,
            udp_pps: (base * self.config.udp_multiplier) as u64,
            icmp_pps: (base * 0.1 * self.config.icmp_multiplier).max(floor) as u64,
            global_pps: (base * self.config.global_multiplier) as u64,
        }
    }

    /// Write the learned pps/bps means into the data plane configuration map
    pub async fn update_config_map(&self) -> Result<(), BaselineError> {
        let (mean_pps, mean_bps) = {
            let state = self.state.read().await;
            (state.pps.mean, state.bps.mean)
        };

        for (key, value) in [(keys::BASELINE_PPS, mean_pps), (keys::BASELINE_BPS, mean_bps)] {
            self.config_map
                .update(key, value as u64)
                .await
                .map_err(|source| BaselineError::ConfigMapError { key, source })?;
        }

        self.state.write().await.last_push = Some(Utc::now());

        gauge!("scrubber_baseline_pps", mean_pps);
        gauge!("scrubber_baseline_bps", mean_bps);
        debug!("Baseline pushed to data plane: {:.0} pps, {:.0} bps", mean_pps, mean_bps);

        Ok(())
    }

    /// True once the learning period has been completed
    pub async fn is_operational(&self) -> bool {
        self.state.read().await.sample_count >= self.config.learning_period
    }

    pub async fn sample_count(&self) -> u64 {
        self.state.read().await.sample_count
    }

    pub async fn last_push(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_push
    }

    /// Forget everything learned and re-enter the learning period
    pub async fn reset(&self) {
        *self.state.write().await = BaselineState::default();
        info!("Baseline reset, re-entering learning period");
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_plane::{MemoryDataPlane, MockConfigMap};
    use tokio_test::{assert_err, assert_ok};

    fn baseline(plane: &MemoryDataPlane) -> Baseline {
        Baseline::new(Arc::new(plane.clone()), BaselineConfig::default())
    }

    #[tokio::test]
    async fn test_first_sample_seeds_mean_with_zero_variance() {
        let engine = baseline(&MemoryDataPlane::new());
        engine.feed(1234.0, 9_000_000.0, 12.0).await;

        let metrics = engine.metrics().await;
        assert_eq!(metrics.baseline_pps, 1234.0);
        assert_eq!(metrics.baseline_bps, 9_000_000.0);
        assert_eq!(metrics.std_dev_pps, 0.0);
        assert_eq!(metrics.std_dev_bps, 0.0);
        assert_eq!(metrics.z_score_pps, 0.0);
        assert_eq!(engine.sample_count().await, 1);
    }

    #[test]
    fn test_ewma_update_is_convex_combination() {
        for &alpha in &[0.001, 0.01, 0.3, 0.9] {
            for &(mean, x) in &[(100.0, 5000.0), (5000.0, 100.0), (42.0, 42.0)] {
                let mut ewma = Ewma::default();
                ewma.seed(mean);
                ewma.update(alpha, x);

                let expected = alpha * x + (1.0 - alpha) * mean;
                assert!((ewma.mean - expected).abs() < 1e-9);
                let (lo, hi) = if x < mean { (x, mean) } else { (mean, x) };
                assert!(ewma.mean >= lo && ewma.mean <= hi);
                assert!(ewma.variance >= 0.0);
            }
        }
    }

    #[test]
    fn test_z_score_is_zero_on_flat_signal() {
        assert_eq!(z_score(1_000_000.0, 1.0, 0.0), 0.0);
        assert_eq!(z_score(-5.0, 10.0, 1e-10), 0.0);
        assert_eq!(z_score(20.0, 10.0, 2.0), 5.0);
    }

    #[tokio::test]
    async fn test_no_anomaly_during_learning_period() {
        let engine = baseline(&MemoryDataPlane::new());
        for _ in 0..10 {
            engine.feed(100.0, 1000.0, 0.0).await;
        }
        engine.feed(1_000_000.0, 1_000_000_000.0, 0.0).await;

        let metrics = engine.metrics().await;
        assert!(metrics.anomaly_score > 3.0);
        assert!(!metrics.is_anomaly);
        assert!(!engine.is_operational().await);
    }

    #[tokio::test]
    async fn test_spike_after_learning_is_anomalous() {
        let engine = baseline(&MemoryDataPlane::new());
        for _ in 0..300 {
            engine.feed(100.0, 1_200_000.0, 0.0).await;
        }
        assert!(engine.is_operational().await);
        assert!(!engine.metrics().await.is_anomaly);

        engine.feed(100_000.0, 1_200_000.0, 0.0).await;

        let metrics = engine.metrics().await;
        assert!(metrics.is_anomaly);
        assert!(metrics.z_score_pps > 3.0);
        assert_eq!(metrics.anomaly_score, metrics.z_score_pps);
    }

    #[tokio::test]
    async fn test_adaptive_rates_apply_floor() {
        let engine = baseline(&MemoryDataPlane::new());
        engine.feed(5.0, 100.0, 0.0).await;

        let rates = engine.adaptive_rates().await;
        assert_eq!(
            rates,
            AdaptiveRates {
                syn_pps: 300,
                udp_pps: 200,
                icmp_pps: 100,
                global_pps: 200,
            }
        );
    }

    #[tokio::test]
    async fn test_adaptive_rates_scale_with_mean() {
        let engine = baseline(&MemoryDataPlane::new());
        engine.feed(10_000.0, 0.0, 0.0).await;

        let rates = engine.adaptive_rates().await;
        assert_eq!(rates.syn_pps, 30_000);
        assert_eq!(rates.udp_pps, 20_000);
        assert_eq!(rates.icmp_pps, 5_000);
        assert_eq!(rates.global_pps, 20_000);
    }

    #[tokio::test]
    async fn test_update_config_map_writes_baseline_keys() {
        let plane = MemoryDataPlane::new();
        let engine = baseline(&plane);
        engine.feed(2500.0, 8_000_000.0, 0.0).await;

        assert_ok!(engine.update_config_map().await);

        let entries = plane.config_entries().await;
        assert_eq!(entries.get(&keys::BASELINE_PPS), Some(&2500));
        assert_eq!(entries.get(&keys::BASELINE_BPS), Some(&8_000_000));
        assert!(engine.last_push().await.is_some());
    }

    #[tokio::test]
    async fn test_update_config_map_propagates_write_failure() {
        let mut map = MockConfigMap::new();
        map.expect_update().returning(|_, _| {
            Box::pin(async { Err(ConfigMapError::Unavailable("map closed".to_string())) })
        });
        let engine = Baseline::new(Arc::new(map), BaselineConfig::default());
        engine.feed(100.0, 100.0, 0.0).await;

        let err = assert_err!(engine.update_config_map().await);
        assert!(matches!(
            err,
            BaselineError::ConfigMapError {
                key: keys::BASELINE_PPS,
                ..
            }
        ));
        assert!(engine.last_push().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_feeds_are_all_counted() {
        let plane = MemoryDataPlane::new();
        let engine = Arc::new(baseline(&plane));

        let tasks: Vec<_> = (0..500)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.feed(500.0, 4_000_000.0, 0.0).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(engine.sample_count().await, 500);
        assert!(engine.is_operational().await);
        // A start that skipped seeding would drag the mean toward zero
        let metrics = engine.metrics().await;
        assert!((metrics.baseline_pps - 500.0).abs() < 1e-6);
        assert!((metrics.baseline_bps - 4_000_000.0).abs() < 1e-3);
        assert!(metrics.std_dev_pps < 1e-6);
    }

    #[tokio::test]
    async fn test_reset_restarts_learning() {
        let engine = baseline(&MemoryDataPlane::new());
        for _ in 0..300 {
            engine.feed(100.0, 100.0, 1.0).await;
        }
        assert!(engine.is_operational().await);

        engine.reset().await;

        assert_eq!(engine.sample_count().await, 0);
        assert!(!engine.is_operational().await);
        assert_eq!(engine.metrics().await, Metrics::default());
    }

    #[tokio::test]
    async fn test_push_loop_waits_for_learning_period() {
        let plane = MemoryDataPlane::new();
        let config = BaselineConfig {
            learning_period: 3,
            ..Default::default()
        };
        let engine = Arc::new(
            Baseline::new(Arc::new(plane.clone()), config).with_push_interval(Duration::from_millis(10)),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = engine.start(shutdown_rx);

        engine.feed(700.0, 5600.0, 0.0).await;
        time::sleep(Duration::from_millis(50)).await;
        assert!(plane.config_entries().await.is_empty());

        engine.feed(700.0, 5600.0, 0.0).await;
        engine.feed(700.0, 5600.0, 0.0).await;
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(plane.config_entries().await.get(&keys::BASELINE_PPS), Some(&700));

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
