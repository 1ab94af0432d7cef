//! Wiring of the adaptive defense loop.
//!
//! Every collector snapshot feeds the baseline. At most once per evaluation
//! interval, the latest rates and the baseline's anomaly score drive the
//! escalation engine.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::core::baseline::Baseline;
use crate::core::escalation::{EscalationEngine, Level};
use crate::core::stats_collector::{Rates, Snapshot, StatsCollector};

/// Dropped packets per received packet, 0 when nothing was received
pub fn drop_ratio(rates: &Rates) -> f64 {
    if rates.rx_pps > 0.0 {
        rates.drop_pps / rates.rx_pps
    } else {
        0.0
    }
}

/// Drives baseline learning and escalation from collector snapshots
pub struct DefensePipeline {
    collector: Arc<StatsCollector>,
    baseline: Arc<Baseline>,
    escalation: Arc<EscalationEngine>,
    evaluation_interval: Duration,
    buffer: usize,
}

impl DefensePipeline {
    pub fn new(
        collector: Arc<StatsCollector>,
        baseline: Arc<Baseline>,
        escalation: Arc<EscalationEngine>,
        evaluation_interval: Duration,
    ) -> Self {
        Self {
            collector,
            baseline,
            escalation,
            evaluation_interval,
            buffer: 16,
        }
    }

    /// Register the pipeline's queue with the collector.
    ///
    /// Call this before the collector starts so the first snapshot is not
    /// missed, then hand the receiver to [`DefensePipeline::run`].
    pub async fn subscribe(&self) -> mpsc::Receiver<Arc<Snapshot>> {
        self.collector.subscribe(self.buffer).await
    }

    /// Consume snapshots until shutdown or until the collector goes away
    pub async fn run(
        &self,
        mut snapshots: mpsc::Receiver<Arc<Snapshot>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_evaluation: Option<Instant> = None;

        info!(
            "Defense pipeline started (evaluation interval: {:?})",
            self.evaluation_interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                snapshot = snapshots.recv() => {
                    let Some(snapshot) = snapshot else { break };
                    if !snapshot.has_rates {
                        debug!("Skipping snapshot without rates");
                        continue;
                    }
                    self.feed(&snapshot).await;

                    let now = Instant::now();
                    let due = last_evaluation
                        .map(|at| now.duration_since(at) >= self.evaluation_interval)
                        .unwrap_or(true);
                    if due {
                        last_evaluation = Some(now);
                        self.evaluate(&snapshot).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Defense pipeline stopped");
    }

    /// Feed one snapshot's rates into the baseline.
    ///
    /// Snapshots without computed rates (the first poll, or no elapsed time)
    /// are ignored so they cannot seed the baseline with zeros.
    pub async fn feed(&self, snapshot: &Snapshot) {
        if !snapshot.has_rates {
            return;
        }
        let rates = &snapshot.rates;
        self.baseline.feed(rates.rx_pps, rates.rx_bps, rates.drop_pps).await;
    }

    /// Run one escalation evaluation against `snapshot`.
    ///
    /// The anomaly score only counts once the baseline is operational, so the
    /// noisy first samples of the learning period cannot escalate.
    pub async fn evaluate(&self, snapshot: &Snapshot) -> Level {
        let rates = &snapshot.rates;
        let z_score = if self.baseline.is_operational().await {
            self.baseline.metrics().await.anomaly_score
        } else {
            0.0
        };
        let ratio = drop_ratio(rates);

        debug!(
            "Evaluating escalation: rx_pps={:.0} drop_pps={:.0} ratio={:.3} z={:.2}",
            rates.rx_pps, rates.drop_pps, ratio, z_score
        );

        self.escalation
            .evaluate(
                rates.rx_pps,
                rates.drop_pps,
                ratio,
                z_score,
                snapshot.counters.reputation_blocked,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::baseline::BaselineConfig;
    use crate::core::data_plane::{keys, ConfigMap, GlobalStats, MemoryDataPlane};
    use crate::core::escalation::EscalationConfig;
    use chrono::{DateTime, Utc};
    use tokio::time;

    struct Traffic {
        plane: MemoryDataPlane,
        pipeline: DefensePipeline,
        baseline: Arc<Baseline>,
        escalation: Arc<EscalationEngine>,
        counters: GlobalStats,
        clock: DateTime<Utc>,
        last: Option<Snapshot>,
    }

    impl Traffic {
        fn new() -> Self {
            let plane = MemoryDataPlane::new();
            let map: Arc<dyn ConfigMap> = Arc::new(plane.clone());
            let collector = Arc::new(StatsCollector::new(Arc::new(plane.clone()), Duration::from_secs(1)));
            let baseline = Arc::new(Baseline::new(map.clone(), BaselineConfig::default()));
            let escalation = Arc::new(EscalationEngine::new(map, EscalationConfig::default()));
            let pipeline = DefensePipeline::new(
                collector,
                baseline.clone(),
                escalation.clone(),
                Duration::from_secs(5),
            );
            Self {
                plane,
                pipeline,
                baseline,
                escalation,
                counters: GlobalStats::default(),
                clock: Utc::now(),
                last: None,
            }
        }

        /// Advance one second of traffic and return the resulting snapshot
        fn tick(&mut self, rx_pps: u64, drop_pps: u64) -> Snapshot {
            self.clock = self.clock + chrono::Duration::seconds(1);
            self.counters.rx_packets += rx_pps;
            self.counters.rx_bytes += rx_pps * 100;
            self.counters.dropped_packets += drop_pps;
            self.counters.dropped_bytes += drop_pps * 100;
            let snapshot = Snapshot::new(self.clock, self.counters, self.last.as_ref());
            self.last = Some(snapshot.clone());
            snapshot
        }
    }

    #[test]
    fn test_drop_ratio_handles_idle_link() {
        assert_eq!(drop_ratio(&Rates::default()), 0.0);
        let rates = Rates {
            rx_pps: 1000.0,
            drop_pps: 250.0,
            ..Default::default()
        };
        assert_eq!(drop_ratio(&rates), 0.25);
    }

    #[tokio::test]
    async fn test_learning_period_suppresses_z_score() {
        let mut traffic = Traffic::new();
        let first = traffic.tick(100, 0);
        traffic.pipeline.feed(&first).await;
        for pps in [100, 120, 90, 5000] {
            let snapshot = traffic.tick(pps, 0);
            traffic.pipeline.feed(&snapshot).await;
        }
        let snapshot = traffic.tick(5000, 0);
        traffic.pipeline.feed(&snapshot).await;

        assert_eq!(traffic.pipeline.evaluate(&snapshot).await, Level::Low);
    }

    #[tokio::test]
    async fn test_attack_escalates_then_subsides() {
        let mut traffic = Traffic::new();
        let first = traffic.tick(100, 0);
        traffic.pipeline.feed(&first).await;
        assert_eq!(traffic.baseline.sample_count().await, 0);

        for _ in 0..300 {
            let snapshot = traffic.tick(100, 0);
            traffic.pipeline.feed(&snapshot).await;
        }
        assert!(traffic.baseline.is_operational().await);

        let attack = traffic.tick(100_000, 35_000);
        traffic.pipeline.feed(&attack).await;
        let metrics = traffic.baseline.metrics().await;
        assert!(metrics.is_anomaly);
        assert!(metrics.anomaly_score > 3.0);

        // A ten sigma spike crosses the CRITICAL z-score threshold outright
        assert_eq!(traffic.pipeline.evaluate(&attack).await, Level::Critical);
        assert_eq!(traffic.plane.lookup(keys::ESCALATION_LEVEL).await.unwrap(), Some(3));

        for expected in [Level::Critical, Level::Critical, Level::High] {
            let calm = traffic.tick(100, 0);
            traffic.pipeline.feed(&calm).await;
            assert_eq!(traffic.pipeline.evaluate(&calm).await, expected);
        }
        assert_eq!(traffic.escalation.level().await, Level::High);
    }

    #[tokio::test]
    async fn test_run_feeds_baseline_from_collector() {
        let plane = MemoryDataPlane::new();
        plane
            .set_stats(GlobalStats {
                rx_packets: 10,
                ..Default::default()
            })
            .await;
        let map: Arc<dyn ConfigMap> = Arc::new(plane.clone());
        let collector = Arc::new(StatsCollector::new(Arc::new(plane.clone()), Duration::from_millis(10)));
        let baseline = Arc::new(Baseline::new(map.clone(), BaselineConfig::default()));
        let escalation = Arc::new(EscalationEngine::new(map, EscalationConfig::default()));
        let pipeline = Arc::new(DefensePipeline::new(
            collector.clone(),
            baseline.clone(),
            escalation,
            Duration::from_millis(10),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let snapshots = pipeline.subscribe().await;
        let pipeline_task = {
            let pipeline = pipeline.clone();
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { pipeline.run(snapshots, rx).await })
        };
        let collector_task = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.run(shutdown_rx).await })
        };

        time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        time::timeout(Duration::from_secs(1), collector_task).await.unwrap().unwrap();
        time::timeout(Duration::from_secs(1), pipeline_task).await.unwrap().unwrap();
        assert!(baseline.sample_count().await > 0);
    }

    #[tokio::test]
    async fn test_first_collected_snapshot_does_not_seed_baseline() {
        let plane = MemoryDataPlane::new();
        plane
            .set_stats(GlobalStats {
                rx_packets: 1_000_000,
                rx_bytes: 100_000_000,
                ..Default::default()
            })
            .await;
        let map: Arc<dyn ConfigMap> = Arc::new(plane.clone());
        let collector = Arc::new(StatsCollector::new(Arc::new(plane.clone()), Duration::from_secs(1)));
        let baseline = Arc::new(Baseline::new(map.clone(), BaselineConfig::default()));
        let escalation = Arc::new(EscalationEngine::new(map, EscalationConfig::default()));
        let pipeline = DefensePipeline::new(collector.clone(), baseline.clone(), escalation, Duration::from_secs(5));

        let first = collector.collect().await.unwrap();
        assert!(!first.has_rates);
        pipeline.feed(&first).await;
        assert_eq!(baseline.sample_count().await, 0);

        time::sleep(Duration::from_millis(20)).await;
        plane
            .set_stats(GlobalStats {
                rx_packets: 1_001_000,
                rx_bytes: 100_100_000,
                ..Default::default()
            })
            .await;
        let second = collector.collect().await.unwrap();
        assert!(second.has_rates);
        pipeline.feed(&second).await;

        let metrics = baseline.metrics().await;
        assert_eq!(baseline.sample_count().await, 1);
        assert!(metrics.baseline_pps > 0.0);
        assert_eq!(metrics.baseline_pps, second.rates.rx_pps);
        assert_eq!(metrics.std_dev_pps, 0.0);
    }
}
