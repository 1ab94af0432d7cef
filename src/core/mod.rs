//! Core functionality for the scrubber control plane.
//!
//! This module contains the data plane seams, the stats collector, the
//! traffic baseline, the escalation state machine and the loop tying them
//! together.

pub mod baseline;
pub mod data_plane;
pub mod escalation;
pub mod notifier;
pub mod pipeline;
pub mod stats_collector;

pub use baseline::{AdaptiveRates, Baseline, BaselineConfig, BaselineError, Metrics};
pub use data_plane::{
    keys, ConfigMap, ConfigMapError, GlobalStats, MemoryDataPlane, RedisDataPlane, StatsSource,
    StatsSourceError,
};
pub use escalation::{
    EscalationConfig, EscalationEngine, EscalationError, EscalationEvent, Level, Trigger,
    TriggerKind,
};
pub use notifier::{LevelChangeNotice, NoticeKind, WebhookNotifier};
pub use pipeline::{drop_ratio, DefensePipeline};
pub use stats_collector::{Rates, Snapshot, StatsCollector};
