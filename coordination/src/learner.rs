//! Pattern Learner: per-pattern confidence thresholds tuned from outcomes
//!
//! Outcomes are aggregated by [`PatternKey`] `(signal_type, target_agent)`.
//! A sample is one executed handoff whose later outcome was reported through
//! [`HandoffFeedback`]; only [`HandoffFeedback::Progressed`] counts as a
//! success. Once a key has more than `min_samples` samples the threshold for
//! a candidate on route `source -> target` becomes
//!
//! ```text
//! clamp(route_threshold + (target_precision - success_rate) * gain, min, max)
//! ```
//!
//! Until then the vetted route threshold applies unchanged, so a pattern
//! precisely at target keeps its route's value when learning kicks in. The learner runs off the
//! decision path: it observes executed transitions from the event bus and
//! receives feedback over a channel, both in [`spawn_learner`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{LearnerConfig, RoutingConfig};
use crate::events::HandoffEvent;
use crate::state::{
    AgentKind, Expiring, PatternKey, PatternStat, SharedClock, SharedContactStore, SignalType,
    StoreResult, TransitionOutcome, TransitionRecord,
};

/// Downstream verdict on an executed handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffFeedback {
    /// The new owner moved the conversation forward
    Progressed,
    /// The conversation bounced back or was handed off again
    Reverted,
    /// The conversation went quiet
    Stalled,
}

impl HandoffFeedback {
    pub fn is_success(&self) -> bool {
        matches!(self, HandoffFeedback::Progressed)
    }
}

/// Feedback for one transition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSignal {
    pub transition_id: Uuid,
    pub feedback: HandoffFeedback,
}

/// Shared reference to the learner
pub type SharedPatternLearner = Arc<PatternLearner>;

/// Outcome aggregation and threshold adjustment
pub struct PatternLearner {
    config: LearnerConfig,
    routing: RoutingConfig,
    clock: SharedClock,
    stats: DashMap<PatternKey, PatternStat>,
    pending: DashMap<Uuid, Expiring<PendingSample>>,
}

/// Executed transition awaiting feedback
#[derive(Debug, Clone)]
struct PendingSample {
    key: PatternKey,
    route_threshold: f64,
}

impl PatternLearner {
    pub fn new(config: LearnerConfig, routing: RoutingConfig, clock: SharedClock) -> Self {
        Self {
            config,
            routing,
            clock,
            stats: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Create a shared reference to this learner
    pub fn shared(self) -> SharedPatternLearner {
        Arc::new(self)
    }

    /// Threshold the coordinator applies to a candidate
    pub fn effective_threshold(&self, signal: &SignalType, source: AgentKind, target: AgentKind) -> f64 {
        let route = self.routing.route_threshold(source, target);
        let key = PatternKey::new(signal.clone(), target);
        match self.stats.get(&key) {
            Some(stat) if stat.sample_count > self.config.min_samples => self.adjusted(route, &stat),
            _ => route,
        }
    }

    /// Start waiting for feedback on an executed transition
    pub fn observe(&self, record: &TransitionRecord) -> bool {
        if record.outcome != TransitionOutcome::Executed {
            return false;
        }
        let sample = PendingSample {
            key: PatternKey::new(record.signal_type.clone(), record.target_agent),
            route_threshold: self.routing.route_threshold(record.source_agent, record.target_agent),
        };
        self.pending.insert(
            record.id,
            Expiring::new(sample, record.decided_at, self.config.feedback_window()),
        );
        true
    }

    /// Count one sample; `None` if the transition is unknown or too old
    pub fn apply_feedback(&self, transition_id: Uuid, feedback: HandoffFeedback) -> Option<PatternStat> {
        let now = self.clock.now();
        let Some((_, pending)) = self.pending.remove(&transition_id) else {
            debug!(%transition_id, "Feedback for unknown transition ignored");
            return None;
        };
        let Some(PendingSample { key, route_threshold }) = pending.into_live(now) else {
            debug!(%transition_id, "Feedback arrived after the feedback window");
            return None;
        };

        let mut stat = self
            .stats
            .entry(key.clone())
            .or_insert_with(|| PatternStat::new(key, route_threshold, now));
        stat.sample_count += 1;
        if feedback.is_success() {
            stat.success_count += 1;
        }
        stat.updated_at = now;

        if stat.sample_count > self.config.min_samples {
            let before = stat.effective_threshold;
            let next = self.adjusted(stat.base_threshold, &stat);
            stat.effective_threshold = next;
            if (stat.effective_threshold - before).abs() > f64::EPSILON {
                info!(
                    pattern = %stat.key,
                    samples = stat.sample_count,
                    from = before,
                    to = stat.effective_threshold,
                    "Pattern threshold adjusted"
                );
            }
        }
        Some(stat.clone())
    }

    fn adjusted(&self, route_threshold: f64, stat: &PatternStat) -> f64 {
        let offset = stat.adjustment(self.config.target_precision, self.config.gain);
        self.config.clamp(route_threshold + offset)
    }

    pub fn stat(&self, key: &PatternKey) -> Option<PatternStat> {
        self.stats.get(key).map(|s| s.clone())
    }

    /// Every pattern row, ordered by key
    pub fn export(&self) -> Vec<PatternStat> {
        let mut stats: Vec<PatternStat> = self.stats.iter().map(|s| s.clone()).collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Replace pattern rows, clamping thresholds into the configured range
    pub fn import(&self, stats: impl IntoIterator<Item = PatternStat>) -> usize {
        let mut loaded = 0;
        for mut stat in stats {
            stat.base_threshold = self.config.clamp(stat.base_threshold);
            stat.effective_threshold = self.config.clamp(stat.effective_threshold);
            self.stats.insert(stat.key.clone(), stat);
            loaded += 1;
        }
        loaded
    }

    /// Load persisted pattern rows
    pub async fn load_from(&self, store: &SharedContactStore) -> StoreResult<usize> {
        let stats = store.load_patterns().await?;
        Ok(self.import(stats))
    }

    /// Drop transitions whose feedback window has passed
    pub fn prune_pending(&self, now: DateTime<Utc>) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| !p.is_expired(now));
        before - self.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn handle_event(&self, event: Result<HandoffEvent, broadcast::error::TryRecvError>) -> bool {
        use broadcast::error::TryRecvError;
        match event {
            Ok(HandoffEvent::TransitionRecorded { record }) => {
                self.observe(&record);
                true
            }
            Ok(_) => true,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Pattern learner lagged behind the event stream");
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
        }
    }
}

/// Run the learner until the feedback channel closes
///
/// Pattern rows are written to `store` as they change.
pub fn spawn_learner(
    learner: SharedPatternLearner,
    mut events: broadcast::Receiver<HandoffEvent>,
    mut feedback: mpsc::Receiver<FeedbackSignal>,
    store: Option<SharedContactStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;
                event = events.recv(), if events_open => match event {
                    Ok(event) => {
                        learner.handle_event(Ok(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        learner.handle_event(Err(broadcast::error::TryRecvError::Lagged(skipped)));
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                signal = feedback.recv() => {
                    let Some(signal) = signal else { break };
                    // Observe anything published before this feedback was sent.
                    while learner.handle_event(events.try_recv()) {}
                    let Some(stat) = learner.apply_feedback(signal.transition_id, signal.feedback) else {
                        continue;
                    };
                    if let Some(store) = &store {
                        if let Err(e) = store.put_pattern(&stat).await {
                            warn!(pattern = %stat.key, error = %e, "Failed to persist pattern stat");
                        }
                    }
                }
            }
        }
        info!(patterns = learner.stats.len(), "Pattern learner stopped");
    })
}
