//! Multi-level escalation engine for the scrubber control plane.
//!
//! Threat indicators are folded into one of four defense levels. Escalation
//! happens as soon as any threshold of a higher level is crossed, possibly
//! skipping levels. De-escalation moves down one level at a time and only
//! after a streak of consecutive calm evaluations. The active level is
//! mirrored into the data plane configuration map.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::data_plane::{keys, ConfigMap, ConfigMapError};

/// Errors that can occur in the escalation engine
#[derive(Error, Debug)]
pub enum EscalationError {
    #[error("invalid level {0}: must be 0-3")]
    InvalidLevel(i64),
    #[error("failed to push escalation level: {0}")]
    ConfigMapError(#[from] ConfigMapError),
}

/// Defense posture, ordered from calm to full scrub
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    /// Normal operation
    Low = 0,
    /// Elevated: rate limiting active
    Medium = 1,
    /// Attack: aggressive filtering
    High = 2,
    /// Major attack: full scrub and upstream signaling
    Critical = 3,
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Low, Level::Medium, Level::High, Level::Critical];

    /// Value written to the configuration map
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Levels strictly above this one, lowest first
    fn above(self) -> impl Iterator<Item = Level> {
        Self::ALL.into_iter().filter(move |level| *level > self)
    }

    fn below(self) -> Option<Level> {
        match self {
            Level::Low => None,
            Level::Medium => Some(Level::Low),
            Level::High => Some(Level::Medium),
            Level::Critical => Some(Level::High),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Low => "LOW",
            Level::Medium => "MEDIUM",
            Level::High => "HIGH",
            Level::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

impl TryFrom<i64> for Level {
    type Error = EscalationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Level::Low),
            1 => Ok(Level::Medium),
            2 => Ok(Level::High),
            3 => Ok(Level::Critical),
            other => Err(EscalationError::InvalidLevel(other)),
        }
    }
}

/// Thresholds that move the engine up to a level.
///
/// `reputation_blocked` and `drop_pps` are disabled when zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalateThresholds {
    pub drop_ratio: f64,
    pub z_score: f64,
    pub reputation_blocked: u64,
    pub drop_pps: f64,
}

/// Upper bounds that must all hold before dropping down to a level
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeescalateThresholds {
    pub drop_ratio: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalateTable {
    pub medium: EscalateThresholds,
    pub high: EscalateThresholds,
    pub critical: EscalateThresholds,
}

impl EscalateTable {
    fn for_level(&self, level: Level) -> Option<&EscalateThresholds> {
        match level {
            Level::Low => None,
            Level::Medium => Some(&self.medium),
            Level::High => Some(&self.high),
            Level::Critical => Some(&self.critical),
        }
    }
}

impl Default for EscalateTable {
    fn default() -> Self {
        Self {
            medium: EscalateThresholds {
                drop_ratio: 0.10,
                z_score: 2.0,
                reputation_blocked: 0,
                drop_pps: 0.0,
            },
            high: EscalateThresholds {
                drop_ratio: 0.30,
                z_score: 3.0,
                reputation_blocked: 100,
                drop_pps: 0.0,
            },
            critical: EscalateThresholds {
                drop_ratio: 0.50,
                z_score: 5.0,
                reputation_blocked: 0,
                drop_pps: 500_000.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeescalateTable {
    pub low: DeescalateThresholds,
    pub medium: DeescalateThresholds,
    pub high: DeescalateThresholds,
}

impl DeescalateTable {
    fn for_level(&self, level: Level) -> Option<&DeescalateThresholds> {
        match level {
            Level::Low => Some(&self.low),
            Level::Medium => Some(&self.medium),
            Level::High => Some(&self.high),
            Level::Critical => None,
        }
    }
}

impl Default for DeescalateTable {
    fn default() -> Self {
        Self {
            low: DeescalateThresholds {
                drop_ratio: 0.05,
                z_score: 1.0,
            },
            medium: DeescalateThresholds {
                drop_ratio: 0.15,
                z_score: 1.5,
            },
            high: DeescalateThresholds {
                drop_ratio: 0.25,
                z_score: 2.5,
            },
        }
    }
}

/// Escalation engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub escalate: EscalateTable,
    /// Keyed by the level being dropped to
    pub deescalate: DeescalateTable,
    /// Consecutive calm evaluations required to drop one level
    pub hysteresis_count: u32,
    pub max_history: usize,
    /// Seconds between evaluations when driven by the pipeline
    pub evaluation_interval_seconds: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            escalate: EscalateTable::default(),
            deescalate: DeescalateTable::default(),
            hysteresis_count: 3,
            max_history: 1000,
            evaluation_interval_seconds: 5,
        }
    }
}

/// Observed threat indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    DropRatio,
    ZScore,
    ReputationBlocked,
    DropPps,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerKind::DropRatio => "drop_ratio",
            TriggerKind::ZScore => "z_score",
            TriggerKind::ReputationBlocked => "reputation_blocked",
            TriggerKind::DropPps => "drop_pps",
        };
        f.write_str(name)
    }
}

/// State of one indicator as of the latest evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub current: f64,
    /// Threshold of the highest level this indicator activated, 0 if none
    pub threshold: f64,
    pub active: bool,
}

impl Trigger {
    fn idle(kind: TriggerKind, current: f64) -> Self {
        Self {
            kind,
            current,
            threshold: 0.0,
            active: false,
        }
    }

    fn describe(&self) -> String {
        match self.kind {
            TriggerKind::DropRatio | TriggerKind::ZScore => {
                format!("{}={:.2} > {:.2}", self.kind, self.current, self.threshold)
            }
            TriggerKind::ReputationBlocked | TriggerKind::DropPps => {
                format!("{}={:.0} > {:.0}", self.kind, self.current, self.threshold)
            }
        }
    }
}

/// Indicators passed to a single evaluation
#[derive(Debug, Clone, Copy)]
struct Indicators {
    drop_pps: f64,
    drop_ratio: f64,
    z_score: f64,
    reputation_blocked: u64,
}

impl Indicators {
    fn triggers(&self) -> Vec<Trigger> {
        vec![
            Trigger::idle(TriggerKind::DropRatio, self.drop_ratio),
            Trigger::idle(TriggerKind::ZScore, self.z_score),
            Trigger::idle(TriggerKind::ReputationBlocked, self.reputation_blocked as f64),
            Trigger::idle(TriggerKind::DropPps, self.drop_pps),
        ]
    }

    /// Indicators that exceed `thresholds`, with the threshold each crossed
    fn exceeding(&self, thresholds: &EscalateThresholds) -> Vec<Trigger> {
        let mut hits = Vec::new();
        if self.drop_ratio > thresholds.drop_ratio {
            hits.push((TriggerKind::DropRatio, self.drop_ratio, thresholds.drop_ratio));
        }
        if self.z_score > thresholds.z_score {
            hits.push((TriggerKind::ZScore, self.z_score, thresholds.z_score));
        }
        if thresholds.reputation_blocked > 0 && self.reputation_blocked > thresholds.reputation_blocked {
            hits.push((
                TriggerKind::ReputationBlocked,
                self.reputation_blocked as f64,
                thresholds.reputation_blocked as f64,
            ));
        }
        if thresholds.drop_pps > 0.0 && self.drop_pps > thresholds.drop_pps {
            hits.push((TriggerKind::DropPps, self.drop_pps, thresholds.drop_pps));
        }

        hits.into_iter()
            .map(|(kind, current, threshold)| Trigger {
                kind,
                current,
                threshold,
                active: true,
            })
            .collect()
    }
}

/// Record of a level transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub from: Level,
    pub to: Level,
    pub reason: String,
    pub triggers: Vec<Trigger>,
}

impl EscalationEvent {
    fn new(from: Level, to: Level, reason: String, triggers: Vec<Trigger>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            from,
            to,
            reason,
            triggers,
        }
    }
}

pub type CriticalCallback = Arc<dyn Fn() + Send + Sync>;
pub type DeescalateCallback = Arc<dyn Fn(Level) + Send + Sync>;

struct EscalationState {
    level: Level,
    history: VecDeque<EscalationEvent>,
    triggers: Vec<Trigger>,
    deescalate_streak: u32,
    on_critical: Option<CriticalCallback>,
    on_deescalate: Option<DeescalateCallback>,
}

/// Escalation state machine
pub struct EscalationEngine {
    config_map: Arc<dyn ConfigMap>,
    config: EscalationConfig,
    state: RwLock<EscalationState>,
}

impl EscalationEngine {
    /// Create an engine starting at `Level::Low`
    pub fn new(config_map: Arc<dyn ConfigMap>, config: EscalationConfig) -> Self {
        Self {
            config_map,
            config,
            state: RwLock::new(EscalationState {
                level: Level::Low,
                history: VecDeque::with_capacity(64),
                triggers: Vec::new(),
                deescalate_streak: 0,
                on_critical: None,
                on_deescalate: None,
            }),
        }
    }

    /// Push the initial level to the data plane.
    ///
    /// Evaluation is driven by the caller through [`EscalationEngine::evaluate`].
    pub async fn start(&self) -> Result<(), EscalationError> {
        let level = self.state.read().await.level;
        self.config_map.update(keys::ESCALATION_LEVEL, level.as_u64()).await?;
        gauge!("scrubber_escalation_level", level.as_u64() as f64);
        info!("Escalation engine started at level {}", level);
        Ok(())
    }

    /// Fold the latest threat indicators into the escalation level.
    ///
    /// Calls are serialized; the returned level is the one now active.
    pub async fn evaluate(
        &self,
        rx_pps: f64,
        drop_pps: f64,
        drop_ratio: f64,
        z_score: f64,
        reputation_blocked: u64,
    ) -> Level {
        let indicators = Indicators {
            drop_pps,
            drop_ratio,
            z_score,
            reputation_blocked,
        };

        let mut state = self.state.write().await;
        let from = state.level;
        let mut triggers = indicators.triggers();

        let mut escalation: Option<(Level, Vec<Trigger>)> = None;
        for target in from.above() {
            let Some(thresholds) = self.config.escalate.for_level(target) else {
                continue;
            };
            let hits = indicators.exceeding(thresholds);
            if hits.is_empty() {
                continue;
            }
            for hit in &hits {
                if let Some(trigger) = triggers.iter_mut().find(|t| t.kind == hit.kind) {
                    *trigger = *hit;
                }
            }
            escalation = Some((target, hits));
        }
        state.triggers = triggers.clone();

        debug!(
            "Escalation evaluated at {:.0} rx pps: drop_ratio={:.3} z={:.2} reputation_blocked={}",
            rx_pps, drop_ratio, z_score, reputation_blocked
        );

        if let Some((to, hits)) = escalation {
            let reason = hits.iter().map(Trigger::describe).collect::<Vec<_>>().join(" OR ");
            let event = EscalationEvent::new(from, to, format!("escalate: {}", reason), triggers);

            state.level = to;
            state.deescalate_streak = 0;
            warn!("Escalation level increased from {} to {} ({})", from, to, event.reason);
            self.append_history(&mut state, event);
            self.push_level_locked(to).await;
            counter!("scrubber_escalations_total", 1, "direction" => "up");

            if to == Level::Critical {
                if let Some(callback) = state.on_critical.clone() {
                    tokio::task::spawn_blocking(move || callback());
                }
            }
            return to;
        }

        let Some(to) = from.below() else {
            return from;
        };

        let calm = self
            .config
            .deescalate
            .for_level(to)
            .map(|t| drop_ratio < t.drop_ratio && z_score < t.z_score)
            .unwrap_or(false);
        state.deescalate_streak = if calm { state.deescalate_streak + 1 } else { 0 };

        if state.deescalate_streak < self.config.hysteresis_count {
            return from;
        }

        let event = EscalationEvent::new(
            from,
            to,
            format!(
                "de-escalate: {} consecutive evaluations below threshold",
                self.config.hysteresis_count
            ),
            triggers,
        );

        state.level = to;
        state.deescalate_streak = 0;
        info!(
            "Escalation level decreased from {} to {} after {} calm evaluations",
            from, to, self.config.hysteresis_count
        );
        self.append_history(&mut state, event);
        self.push_level_locked(to).await;
        counter!("scrubber_escalations_total", 1, "direction" => "down");

        if let Some(callback) = state.on_deescalate.clone() {
            tokio::task::spawn_blocking(move || callback(to));
        }
        to
    }

    /// Force a level, bypassing hysteresis.
    ///
    /// `level` is the numeric level (0-3); anything else is rejected before
    /// any state changes. The push happens under the state lock, so a
    /// concurrent evaluation cannot be overwritten by a stale manual level.
    pub async fn set_level(&self, level: i64) -> Result<Level, EscalationError> {
        let level = Level::try_from(level)?;

        let mut state = self.state.write().await;
        let from = state.level;
        state.level = level;
        state.deescalate_streak = 0;
        let event = EscalationEvent::new(from, level, "manual override".to_string(), Vec::new());
        self.append_history(&mut state, event);

        let pushed = self.config_map.update(keys::ESCALATION_LEVEL, level.as_u64()).await;
        drop(state);
        pushed?;

        gauge!("scrubber_escalation_level", level.as_u64() as f64);
        info!("Escalation level manually set from {} to {}", from, level);

        Ok(level)
    }

    pub async fn level(&self) -> Level {
        self.state.read().await.level
    }

    /// Transition history, oldest first
    pub async fn history(&self) -> Vec<EscalationEvent> {
        self.state.read().await.history.iter().cloned().collect()
    }

    /// Indicator states from the latest evaluation
    pub async fn triggers(&self) -> Vec<Trigger> {
        self.state.read().await.triggers.clone()
    }

    /// Register the callback fired when the engine escalates to CRITICAL.
    ///
    /// Replaces any previous callback. It runs on the blocking pool and may be
    /// invoked again after every fresh escalation to CRITICAL.
    pub async fn on_critical<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.write().await.on_critical = Some(Arc::new(callback));
    }

    /// Register the callback fired with the new level after each de-escalation
    pub async fn on_deescalate<F>(&self, callback: F)
    where
        F: Fn(Level) + Send + Sync + 'static,
    {
        self.state.write().await.on_deescalate = Some(Arc::new(callback));
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    fn append_history(&self, state: &mut EscalationState, event: EscalationEvent) {
        state.history.push_back(event);
        while state.history.len() > self.config.max_history {
            state.history.pop_front();
        }
    }

    // Runs with the state write lock held so the pushed level is the decided one.
    async fn push_level_locked(&self, level: Level) {
        match self.config_map.update(keys::ESCALATION_LEVEL, level.as_u64()).await {
            Ok(()) => {
                gauge!("scrubber_escalation_level", level.as_u64() as f64);
            }
            Err(e) => error!("Failed to push escalation level {} to data plane: {}", level, e),
        }
    }
}
