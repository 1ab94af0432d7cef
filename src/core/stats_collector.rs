//! Statistics collection for the scrubber control plane.
//!
//! The collector polls the data plane's cumulative counters on a fixed
//! interval, turns them into per-second rates and fans each snapshot out to
//! subscribers without ever waiting on a slow consumer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{self, MissedTickBehavior};

use crate::core::data_plane::{GlobalStats, StatsSource};

/// Per-second rates derived from two consecutive snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Rates {
    pub rx_pps: f64,
    /// Bits per second
    pub rx_bps: f64,
    pub tx_pps: f64,
    pub tx_bps: f64,
    pub drop_pps: f64,
    pub drop_bps: f64,
    pub syn_flood_pps: f64,
    pub udp_flood_pps: f64,
    pub icmp_flood_pps: f64,
    pub ack_flood_pps: f64,
}

/// Point-in-time view of the data plane counters and their rates
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub counters: GlobalStats,
    pub rates: Rates,
    /// False when there was nothing to compute rates against
    pub has_rates: bool,
}

impl Snapshot {
    /// Build a snapshot, computing rates against `previous` when there is one.
    ///
    /// Rates stay at zero without a previous snapshot or when the elapsed time
    /// is not positive. A counter that went backwards contributes a zero delta.
    pub fn new(timestamp: DateTime<Utc>, counters: GlobalStats, previous: Option<&Snapshot>) -> Self {
        let rates = previous.and_then(|prev| {
            let elapsed = elapsed_seconds(prev.timestamp, timestamp);
            (elapsed > 0.0).then(|| compute_rates(&prev.counters, &counters, elapsed))
        });

        Self {
            timestamp,
            counters,
            has_rates: rates.is_some(),
            rates: rates.unwrap_or_default(),
        }
    }
}

fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from)
        .num_nanoseconds()
        .map(|nanos| nanos as f64 / 1e9)
        .unwrap_or(0.0)
}

fn compute_rates(prev: &GlobalStats, now: &GlobalStats, elapsed: f64) -> Rates {
    let per_sec = |current: u64, before: u64| current.saturating_sub(before) as f64 / elapsed;
    let bits_per_sec = |current: u64, before: u64| per_sec(current, before) * 8.0;

    Rates {
        rx_pps: per_sec(now.rx_packets, prev.rx_packets),
        rx_bps: bits_per_sec(now.rx_bytes, prev.rx_bytes),
        tx_pps: per_sec(now.tx_packets, prev.tx_packets),
        tx_bps: bits_per_sec(now.tx_bytes, prev.tx_bytes),
        drop_pps: per_sec(now.dropped_packets, prev.dropped_packets),
        drop_bps: bits_per_sec(now.dropped_bytes, prev.dropped_bytes),
        syn_flood_pps: per_sec(now.syn_flood_dropped, prev.syn_flood_dropped),
        udp_flood_pps: per_sec(now.udp_flood_dropped, prev.udp_flood_dropped),
        icmp_flood_pps: per_sec(now.icmp_flood_dropped, prev.icmp_flood_dropped),
        ack_flood_pps: per_sec(now.ack_flood_dropped, prev.ack_flood_dropped),
    }
}

/// True when a cumulative counter decreased, which means the data plane restarted
fn counters_regressed(prev: &GlobalStats, now: &GlobalStats) -> bool {
    now.rx_packets < prev.rx_packets
        || now.rx_bytes < prev.rx_bytes
        || now.tx_packets < prev.tx_packets
        || now.tx_bytes < prev.tx_bytes
        || now.dropped_packets < prev.dropped_packets
        || now.dropped_bytes < prev.dropped_bytes
}

#[derive(Debug, Default)]
struct CollectorState {
    current: Option<Arc<Snapshot>>,
    previous: Option<Arc<Snapshot>>,
}

/// Periodically reads data plane counters and publishes rate snapshots
pub struct StatsCollector {
    source: Arc<dyn StatsSource>,
    interval: Duration,
    state: RwLock<CollectorState>,
    subscribers: RwLock<Vec<mpsc::Sender<Arc<Snapshot>>>>,
}

impl StatsCollector {
    /// Create a collector polling `source` every `interval`
    pub fn new(source: Arc<dyn StatsSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            state: RwLock::new(CollectorState::default()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a bounded queue receiving every new snapshot.
    ///
    /// Delivery is best effort: when the queue is full the snapshot is dropped
    /// for this subscriber only.
    pub async fn subscribe(&self, capacity: usize) -> mpsc::Receiver<Arc<Snapshot>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.write().await.push(tx);
        rx
    }

    /// Poll until `shutdown` flips to true or its sender goes away
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Stats collector started (interval: {:?})", self.interval);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.collect().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Stats collector stopped");
    }

    /// Take one reading, store it as current and publish it.
    ///
    /// Returns `None` when the counters could not be read.
    pub async fn collect(&self) -> Option<Arc<Snapshot>> {
        let counters = match self.source.read_stats().await {
            Ok(counters) => counters,
            Err(e) => {
                warn!("Failed to read data plane stats: {}", e);
                counter!("scrubber_stats_read_failures_total", 1);
                return None;
            }
        };

        let snapshot = {
            let mut state = self.state.write().await;
            if let Some(prev) = state.current.as_deref() {
                if counters_regressed(&prev.counters, &counters) {
                    warn!("Data plane counters went backwards, treating deltas as zero for this sample");
                }
            }
            let snapshot = Arc::new(Snapshot::new(Utc::now(), counters, state.current.as_deref()));
            state.previous = state.current.replace(snapshot.clone());
            snapshot
        };

        gauge!("scrubber_rx_pps", snapshot.rates.rx_pps);
        gauge!("scrubber_drop_pps", snapshot.rates.drop_pps);

        self.publish(&snapshot).await;
        Some(snapshot)
    }

    async fn publish(&self, snapshot: &Arc<Snapshot>) {
        let mut saw_closed = false;
        {
            let subscribers = self.subscribers.read().await;
            for tx in subscribers.iter() {
                match tx.try_send(snapshot.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("Subscriber queue full, dropping snapshot");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => saw_closed = true,
                }
            }
        }

        if saw_closed {
            self.subscribers.write().await.retain(|tx| !tx.is_closed());
        }
    }

    /// Most recent snapshot
    pub async fn current(&self) -> Option<Arc<Snapshot>> {
        self.state.read().await.current.clone()
    }

    /// Snapshot taken before the current one
    pub async fn previous(&self) -> Option<Arc<Snapshot>> {
        self.state.read().await.previous.clone()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
