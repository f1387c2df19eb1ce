//! Handoff Coordinator
//!
//! Decides whether an inbound [`HandoffCandidate`] moves a conversation to
//! another agent. Gates run in a fixed order and short-circuit:
//!
//! ```text
//!  candidate ─▶ validate ─▶ ownership ─▶ confidence ─▶ depth ─▶ rate ─▶ circular ─▶ health ─▶ lock
//!                                            │            │                                  │
//!                                      (human target) (depth reached)                        ▼
//!                                            └──▶ escalate ◀┘                       execute under lock
//!                                                                                    re-check, mutate,
//!                                                                                    record, release
//!                                                                                          │
//!                                                                                          ▼
//!                                                                                deliver context + tags
//! ```
//!
//! Gates before the lock only read, or use the rate limiter's own atomic
//! windows. Every ownership change happens while the contact lease is held,
//! after re-reading the contact and atomically consuming rate-limit budget.
//! Every recorded decision is appended to the transition log and published on
//! the event bus; stale, contended and invalid candidates are not recorded.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::circular::CircularGuard;
use crate::config::HandoffConfig;
use crate::context::{ClaimOutcome, ContextPackage, ContextPackager, ConversationSnapshot};
use crate::error::{HandoffError, HandoffResult};
use crate::events::{EscalationReason, EventBus, HandoffEvent, SharedEventBus, TransitionHistory};
use crate::learner::{spawn_learner, FeedbackSignal, HandoffFeedback, PatternLearner, SharedPatternLearner};
use crate::lock::{ContactLockGuard, ContactLockManager, LockAcquisition, SharedLockManager};
use crate::messaging::{handoff_tags, MessagingError, NullMessaging, SharedMessaging, SharedScorer};
use crate::rate_limit::{RateLimiter, RateVerdict, RateWindow};
use crate::registry::{AgentHealthRegistry, DegradedReason, HealthAssessment, SharedHealthRegistry};
use crate::state::{
    bounded, AgentKind, Contact, ContactId, ContactStatus, HandoffCandidate, InMemoryContactStore,
    InMemoryEphemeralStore, RoutingStatus, SharedClock, SharedContactStore, SharedEphemeralStore,
    StoreError, SystemClock, TransitionOutcome, TransitionRecord,
};

/// Characters of the triggering message kept on a scored candidate
const EXCERPT_CHARS: usize = 160;

// ── Decision ────────────────────────────────────────────────────────────────

/// Why a candidate was turned down
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Malformed candidate
    InvalidCandidate { detail: String },
    /// Candidate source no longer owns the conversation
    StaleSource { current: AgentKind },
    /// Contact is with the human operator
    Escalated,
    /// Contact is closed
    Closed,
    BelowThreshold { confidence: f64, threshold: f64 },
    RateLimited { window: RateWindow },
    /// The pair or its reverse executed within the cooldown
    Circular {
        previous_source: AgentKind,
        previous_target: AgentKind,
        decided_at: DateTime<Utc>,
    },
    /// Chain depth reached; the contact was escalated
    DepthExceeded { depth: u32 },
    /// A backend failed and the coordinator failed closed
    BackendUnavailable { detail: String },
}

impl RejectionReason {
    /// Stable short code for logs and metrics
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::InvalidCandidate { .. } => "invalid_candidate",
            RejectionReason::StaleSource { .. } => "stale_source",
            RejectionReason::Escalated => "escalated",
            RejectionReason::Closed => "closed",
            RejectionReason::BelowThreshold { .. } => "below_threshold",
            RejectionReason::RateLimited { .. } => "rate_limited",
            RejectionReason::Circular { .. } => "circular",
            RejectionReason::DepthExceeded { .. } => "depth_exceeded",
            RejectionReason::BackendUnavailable { .. } => "backend_unavailable",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Why a candidate was put off rather than dropped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeferReason {
    TargetUnhealthy {
        agent: AgentKind,
        p95_ms: u64,
        error_rate: f64,
        cause: DegradedReason,
    },
    /// Evaluation ran past the overall deadline
    DeadlineExceeded,
}

/// Result of evaluating one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Ownership moved; `package` is staged for the new owner
    Allowed {
        package: ContextPackage,
        record: TransitionRecord,
    },
    /// `record` is `None` for unrecorded paths (stale, invalid, backend down)
    Rejected {
        reason: RejectionReason,
        record: Option<TransitionRecord>,
    },
    /// Another evaluation holds the contact lock; retry
    Contended,
    /// Retry on the next signal
    Deferred {
        reason: DeferReason,
        record: Option<TransitionRecord>,
    },
}

impl Decision {
    fn rejected(reason: RejectionReason, record: Option<TransitionRecord>) -> Self {
        Decision::Rejected { reason, record }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            Decision::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// The transition record written for this decision, if any
    pub fn record(&self) -> Option<&TransitionRecord> {
        match self {
            Decision::Allowed { record, .. } => Some(record),
            Decision::Rejected { record, .. } | Decision::Deferred { record, .. } => record.as_ref(),
            Decision::Contended => None,
        }
    }

    /// Short label: `allowed`, `rejected`, `contended` or `deferred`
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Allowed { .. } => "allowed",
            Decision::Rejected { .. } => "rejected",
            Decision::Contended => "contended",
            Decision::Deferred { .. } => "deferred",
        }
    }
}

/// Where a candidate that passed screening is headed
enum Route {
    Handoff,
    Escalate(EscalationReason),
}

/// Pre-lock screening result
enum Screened {
    Done(Decision),
    Locked { guard: ContactLockGuard, route: Route },
}

type LearnerInputs = (broadcast::Receiver<HandoffEvent>, mpsc::Receiver<FeedbackSignal>);

// ── Builder ─────────────────────────────────────────────────────────────────

/// Wires a [`HandoffCoordinator`] from injected services
///
/// Anything not supplied gets an in-process default.
pub struct HandoffCoordinatorBuilder {
    config: HandoffConfig,
    contacts: Option<SharedContactStore>,
    rate_store: Option<SharedEphemeralStore>,
    lock_store: Option<SharedEphemeralStore>,
    messaging: Option<SharedMessaging>,
    scorer: Option<SharedScorer>,
    clock: Option<SharedClock>,
    health: Option<SharedHealthRegistry>,
    learner: Option<SharedPatternLearner>,
    events: Option<SharedEventBus>,
}

impl HandoffCoordinatorBuilder {
    fn new(config: HandoffConfig) -> Self {
        Self {
            config,
            contacts: None,
            rate_store: None,
            lock_store: None,
            messaging: None,
            scorer: None,
            clock: None,
            health: None,
            learner: None,
            events: None,
        }
    }

    pub fn contact_store(mut self, store: SharedContactStore) -> Self {
        self.contacts = Some(store);
        self
    }

    /// Backing store for both rate windows and lock leases
    pub fn ephemeral_store(mut self, store: SharedEphemeralStore) -> Self {
        self.rate_store = Some(store.clone());
        self.lock_store = Some(store);
        self
    }

    pub fn rate_store(mut self, store: SharedEphemeralStore) -> Self {
        self.rate_store = Some(store);
        self
    }

    pub fn lock_store(mut self, store: SharedEphemeralStore) -> Self {
        self.lock_store = Some(store);
        self
    }

    pub fn messaging(mut self, messaging: SharedMessaging) -> Self {
        self.messaging = Some(messaging);
        self
    }

    pub fn scorer(mut self, scorer: SharedScorer) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn health_registry(mut self, registry: SharedHealthRegistry) -> Self {
        self.health = Some(registry);
        self
    }

    pub fn learner(mut self, learner: SharedPatternLearner) -> Self {
        self.learner = Some(learner);
        self
    }

    pub fn event_bus(mut self, bus: SharedEventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Validate the config and assemble the coordinator
    pub fn build(self) -> HandoffResult<HandoffCoordinator> {
        self.config.validate()?;
        let config = self.config;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock) as SharedClock);
        let ephemeral = InMemoryEphemeralStore::new().shared();
        let rate_store = self.rate_store.unwrap_or_else(|| ephemeral.clone());
        let lock_store = self.lock_store.unwrap_or(ephemeral);
        let contacts = self
            .contacts
            .unwrap_or_else(|| InMemoryContactStore::new().shared());
        let health = self.health.unwrap_or_else(|| {
            AgentHealthRegistry::new(config.health.clone(), clock.clone()).shared()
        });
        let learner = self.learner.unwrap_or_else(|| {
            PatternLearner::new(config.learner.clone(), config.routing.clone(), clock.clone()).shared()
        });
        let events = self.events.unwrap_or_else(|| EventBus::new().shared());

        // Subscribe before anything can publish so the learner misses nothing.
        let learner_events = events.subscribe();
        let (feedback_tx, feedback_rx) = mpsc::channel(config.learner.channel_capacity.max(1));

        let gate_timeout = config.deadlines.gate_timeout();
        Ok(HandoffCoordinator {
            rate_limiter: RateLimiter::new(rate_store, config.rate_limit.clone(), gate_timeout),
            circular: CircularGuard::new(&config.circular),
            locks: Arc::new(ContactLockManager::new(lock_store, clock.clone(), config.lock.clone())),
            packager: ContextPackager::new(config.context.clone()),
            messaging: self
                .messaging
                .unwrap_or_else(|| Arc::new(NullMessaging) as SharedMessaging),
            scorer: self.scorer,
            contacts,
            health,
            learner,
            events,
            clock,
            feedback_tx,
            learner_inputs: Mutex::new(Some((learner_events, feedback_rx))),
            config,
        })
    }
}

// ── Coordinator ─────────────────────────────────────────────────────────────

/// Gatekeeper for conversation ownership
pub struct HandoffCoordinator {
    config: HandoffConfig,
    contacts: SharedContactStore,
    rate_limiter: RateLimiter,
    circular: CircularGuard,
    health: SharedHealthRegistry,
    locks: SharedLockManager,
    packager: ContextPackager,
    learner: SharedPatternLearner,
    messaging: SharedMessaging,
    scorer: Option<SharedScorer>,
    events: SharedEventBus,
    clock: SharedClock,
    feedback_tx: mpsc::Sender<FeedbackSignal>,
    learner_inputs: Mutex<Option<LearnerInputs>>,
}

impl HandoffCoordinator {
    pub fn builder(config: HandoffConfig) -> HandoffCoordinatorBuilder {
        HandoffCoordinatorBuilder::new(config)
    }

    /// Rebuild in-memory guard state from the durable log
    ///
    /// Loads learned pattern stats and the executed transitions still inside
    /// the circular cooldown. Call once after `build` when the contact store
    /// outlives the process.
    pub async fn restore(&self) -> HandoffResult<()> {
        let patterns = self.learner.load_from(&self.contacts).await?;
        let now = self.clock.now();
        let recent = self
            .contacts
            .transitions_between(now - self.config.circular.cooldown(), now + Duration::nanoseconds(1))
            .await?;
        let hydrated = self.circular.hydrate(recent.iter());
        info!(patterns, hydrated, "Coordinator state restored");
        Ok(())
    }

    /// Start the pattern learner task; `None` if already started
    pub fn spawn_learner(&self) -> Option<JoinHandle<()>> {
        let inputs = self
            .learner_inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        inputs.map(|(events, feedback)| {
            spawn_learner(self.learner.clone(), events, feedback, Some(self.contacts.clone()))
        })
    }

    /// Evaluate a candidate with no conversation snapshot
    pub async fn evaluate(&self, candidate: HandoffCandidate) -> Decision {
        self.evaluate_with_snapshot(candidate, ConversationSnapshot::default())
            .await
    }

    /// Evaluate a candidate; `snapshot` feeds the context package on success
    pub async fn evaluate_with_snapshot(
        &self,
        candidate: HandoffCandidate,
        snapshot: ConversationSnapshot,
    ) -> Decision {
        if let Err(detail) = candidate.validate() {
            debug!(contact = %candidate.contact_id, %detail, "Invalid handoff candidate");
            return Decision::rejected(RejectionReason::InvalidCandidate { detail }, None);
        }

        let deadline = self.config.deadlines.evaluation_deadline();
        let screened = match tokio::time::timeout(deadline, self.screen(&candidate)).await {
            Ok(screened) => screened,
            Err(_) => {
                warn!(
                    contact = %candidate.contact_id,
                    deadline_ms = self.config.deadlines.evaluation_deadline_ms,
                    "Evaluation deadline exceeded; deferring candidate"
                );
                return Decision::Deferred {
                    reason: DeferReason::DeadlineExceeded,
                    record: None,
                };
            }
        };

        match screened {
            Screened::Done(decision) => decision,
            Screened::Locked {
                guard,
                route: Route::Handoff,
            } => self.execute_handoff(guard, &candidate, &snapshot).await,
            Screened::Locked {
                guard,
                route: Route::Escalate(reason),
            } => self.execute_escalation(guard, &candidate, &snapshot, reason).await,
        }
    }

    /// Score a raw inbound message, then evaluate what it implies
    ///
    /// Returns `Ok(None)` when the message carries no handoff signal or
    /// points back at the current owner.
    pub async fn evaluate_message(
        &self,
        contact_id: &ContactId,
        message: &str,
        snapshot: ConversationSnapshot,
    ) -> HandoffResult<Option<Decision>> {
        let scorer = self
            .scorer
            .as_ref()
            .ok_or_else(|| HandoffError::config("no confidence scorer configured"))?;
        let now = self.clock.now();
        let status = match self.contacts.get_contact(contact_id).await? {
            Some(contact) => contact.status_view(),
            None => Contact::new(contact_id.clone(), self.config.routing.entry_agent, now).status_view(),
        };
        if status.closed {
            return Ok(Some(Decision::rejected(RejectionReason::Closed, None)));
        }
        if status.escalated {
            return Ok(Some(Decision::rejected(RejectionReason::Escalated, None)));
        }

        let timeout = self.config.deadlines.evaluation_deadline();
        let scored = match tokio::time::timeout(timeout, scorer.score(message, &status)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(MessagingError::Timeout(self.config.deadlines.evaluation_deadline_ms).into())
            }
        };
        let Some(signal) = scored else {
            return Ok(None);
        };
        if signal.target_agent == status.active_agent {
            return Ok(None);
        }

        let excerpt: String = message.chars().take(EXCERPT_CHARS).collect();
        let candidate = HandoffCandidate::new(
            contact_id.clone(),
            status.active_agent,
            signal.target_agent,
            signal.confidence,
            signal.signal_type,
            now,
        )
        .with_excerpt(excerpt);
        Ok(Some(self.evaluate_with_snapshot(candidate, snapshot).await))
    }

    // ── Screening (no lock held) ────────────────────────────────────────────

    async fn screen(&self, candidate: &HandoffCandidate) -> Screened {
        let now = self.clock.now();
        let contact = match self.load_or_create(&candidate.contact_id, now).await {
            Ok(contact) => contact,
            Err(e) => return Screened::Done(self.backend_down("contact_store", &candidate.contact_id, e)),
        };
        if let Some(reason) = Self::ownership_mismatch(&contact, candidate) {
            debug!(contact = %candidate.contact_id, reason = %reason, "Candidate no longer applies");
            return Screened::Done(Decision::rejected(reason, None));
        }

        // 1. Confidence
        let threshold = self.learner.effective_threshold(
            &candidate.signal_type,
            candidate.source_agent,
            candidate.target_agent,
        );
        if candidate.confidence < threshold {
            debug!(
                contact = %candidate.contact_id,
                confidence = candidate.confidence,
                threshold,
                "Candidate below confidence threshold"
            );
            let record = self.finalize(candidate, TransitionOutcome::BlockedThreshold).await;
            return Screened::Done(Decision::rejected(
                RejectionReason::BelowThreshold {
                    confidence: candidate.confidence,
                    threshold,
                },
                record,
            ));
        }

        if candidate.target_agent == AgentKind::Human {
            return self
                .lock_for(candidate, Route::Escalate(EscalationReason::Requested))
                .await;
        }

        // 2. Depth; escalation does not spend handoff budget
        if self.circular.depth_exceeded(&contact) {
            return self
                .lock_for(candidate, Route::Escalate(EscalationReason::DepthExceeded))
                .await;
        }

        // 3. Rate windows (read-only here; consumed under the lock)
        match self
            .rate_limiter
            .check(&candidate.contact_id, candidate.source_agent, candidate.target_agent, now)
            .await
        {
            RateVerdict::Within => {}
            RateVerdict::DegradedWithin { cause } => self.publish_degraded("rate_limiter", cause),
            verdict => return Screened::Done(self.rate_blocked(candidate, verdict).await),
        }

        // 4. Ping-pong
        if let Some(decision) = self.circular_blocked(candidate, now).await {
            return Screened::Done(decision);
        }

        // 5. Target health
        match self.health.assess(candidate.target_agent) {
            HealthAssessment::Healthy { .. } => {}
            HealthAssessment::Unknown { fresh_samples } => {
                debug!(agent = %candidate.target_agent, fresh_samples, "Target health unknown; treating as healthy");
                self.events.publish(HandoffEvent::HealthUnknown {
                    agent: candidate.target_agent,
                    fresh_samples,
                    timestamp: now,
                });
            }
            HealthAssessment::Degraded {
                p95_ms,
                error_rate,
                reason,
            } => {
                debug!(
                    contact = %candidate.contact_id,
                    agent = %candidate.target_agent,
                    p95_ms,
                    error_rate,
                    "Target agent degraded; deferring candidate"
                );
                let record = self.finalize(candidate, TransitionOutcome::BlockedUnhealthy).await;
                return Screened::Done(Decision::Deferred {
                    reason: DeferReason::TargetUnhealthy {
                        agent: candidate.target_agent,
                        p95_ms,
                        error_rate,
                        cause: reason,
                    },
                    record,
                });
            }
        }

        // 6. Lock
        self.lock_for(candidate, Route::Handoff).await
    }

    async fn lock_for(&self, candidate: &HandoffCandidate, route: Route) -> Screened {
        match self.locks.acquire(&candidate.contact_id).await {
            Ok(LockAcquisition::Acquired(guard)) => Screened::Locked { guard, route },
            Ok(LockAcquisition::Contended { recent }) => {
                debug!(contact = %candidate.contact_id, recent, "Contact lock contended");
                self.events.publish(HandoffEvent::LockContention {
                    contact_id: candidate.contact_id.clone(),
                    recent,
                    timestamp: self.clock.now(),
                });
                Screened::Done(Decision::Contended)
            }
            Err(e) => Screened::Done(self.backend_down("lock", &candidate.contact_id, e)),
        }
    }

    // ── Execution (lock held) ───────────────────────────────────────────────

    async fn execute_handoff(
        &self,
        guard: ContactLockGuard,
        candidate: &HandoffCandidate,
        snapshot: &ConversationSnapshot,
    ) -> Decision {
        let contact = match self.reload(candidate).await {
            Ok(contact) => contact,
            Err(decision) => {
                self.release(guard).await;
                return decision;
            }
        };

        if self.circular.depth_exceeded(&contact) {
            return self
                .execute_escalation(guard, candidate, snapshot, EscalationReason::DepthExceeded)
                .await;
        }

        let now = self.clock.now();
        if let Some(decision) = self.circular_blocked(candidate, now).await {
            self.release(guard).await;
            return decision;
        }

        match self
            .rate_limiter
            .try_record(&candidate.contact_id, candidate.source_agent, candidate.target_agent, now)
            .await
        {
            RateVerdict::Within => {}
            RateVerdict::DegradedWithin { cause } => self.publish_degraded("rate_limiter", cause),
            verdict => {
                self.release(guard).await;
                return self.rate_blocked(candidate, verdict).await;
            }
        }

        let mut updated = contact;
        updated.transfer_to(candidate.target_agent, now);
        if let Err(e) = bounded(self.gate_timeout(), self.contacts.put_contact(&updated)).await {
            self.release(guard).await;
            return self.backend_down("contact_store", &candidate.contact_id, e);
        }

        let package = self.packager.build(candidate, snapshot, now);
        self.packager.stage(package.clone());
        self.circular
            .record(&candidate.contact_id, candidate.source_agent, candidate.target_agent, now);
        let record = TransitionRecord::for_candidate(candidate, TransitionOutcome::Executed, now);
        self.append_locked(&record).await;
        self.release(guard).await;

        self.events.publish(HandoffEvent::TransitionRecorded {
            record: record.clone(),
        });
        info!(
            contact = %candidate.contact_id,
            source = %candidate.source_agent,
            target = %candidate.target_agent,
            confidence = candidate.confidence,
            signal = %candidate.signal_type,
            depth = updated.handoff_chain_depth,
            "Handoff executed"
        );

        self.deliver(&package).await;
        Decision::Allowed { package, record }
    }

    async fn execute_escalation(
        &self,
        guard: ContactLockGuard,
        candidate: &HandoffCandidate,
        snapshot: &ConversationSnapshot,
        reason: EscalationReason,
    ) -> Decision {
        let contact = match self.reload(candidate).await {
            Ok(contact) => contact,
            Err(decision) => {
                self.release(guard).await;
                return decision;
            }
        };

        let now = self.clock.now();
        let from = contact.active_agent;
        let depth = contact.handoff_chain_depth;
        let mut updated = contact;
        updated.escalate(now);
        if let Err(e) = bounded(self.gate_timeout(), self.contacts.put_contact(&updated)).await {
            self.release(guard).await;
            return self.backend_down("contact_store", &candidate.contact_id, e);
        }

        let outcome = match reason {
            EscalationReason::Requested => TransitionOutcome::Escalated,
            EscalationReason::DepthExceeded => TransitionOutcome::BlockedDepth,
        };
        let record = TransitionRecord::for_candidate(candidate, outcome, now);
        self.append_locked(&record).await;
        self.circular.clear(&candidate.contact_id);
        let package = match reason {
            EscalationReason::Requested => {
                let package = self.packager.build(candidate, snapshot, now);
                self.packager.stage(package.clone());
                Some(package)
            }
            EscalationReason::DepthExceeded => {
                self.packager.discard(&candidate.contact_id);
                None
            }
        };
        self.release(guard).await;

        self.events.publish(HandoffEvent::TransitionRecorded {
            record: record.clone(),
        });
        self.events.publish(HandoffEvent::ContactEscalated {
            contact_id: candidate.contact_id.clone(),
            from,
            reason,
            timestamp: now,
        });
        info!(contact = %candidate.contact_id, from = %from, depth, reason = %reason, "Contact escalated to human");

        self.notify_escalation(&candidate.contact_id, from, reason).await;
        match package {
            Some(package) => {
                self.deliver(&package).await;
                Decision::Allowed { package, record }
            }
            None => Decision::rejected(RejectionReason::DepthExceeded { depth }, Some(record)),
        }
    }

    /// Re-read the contact under the lock and confirm the candidate still applies
    async fn reload(&self, candidate: &HandoffCandidate) -> Result<Contact, Decision> {
        let contact = match bounded(self.gate_timeout(), self.contacts.get_contact(&candidate.contact_id)).await {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                return Err(self.backend_down(
                    "contact_store",
                    &candidate.contact_id,
                    StoreError::NotFound(candidate.contact_id.to_string()),
                ))
            }
            Err(e) => return Err(self.backend_down("contact_store", &candidate.contact_id, e)),
        };
        match Self::ownership_mismatch(&contact, candidate) {
            Some(reason) => {
                debug!(contact = %candidate.contact_id, reason = %reason, "Candidate went stale while waiting for the lock");
                Err(Decision::rejected(reason, None))
            }
            None => Ok(contact),
        }
    }

    // ── Admin API ───────────────────────────────────────────────────────────

    /// Read-only status; never takes the lock
    pub async fn contact_status(&self, contact_id: &ContactId) -> HandoffResult<ContactStatus> {
        self.contacts
            .get_contact(contact_id)
            .await?
            .map(|c| c.status_view())
            .ok_or_else(|| HandoffError::ContactNotFound(contact_id.clone()))
    }

    /// Return an escalated contact to automated routing
    pub async fn reset_escalation(&self, contact_id: &ContactId) -> HandoffResult<ContactStatus> {
        let guard = self.admin_lock(contact_id).await?;
        let result = self.reset_locked(contact_id).await;
        self.release(guard).await;
        result
    }

    async fn reset_locked(&self, contact_id: &ContactId) -> HandoffResult<ContactStatus> {
        let mut contact = self
            .contacts
            .get_contact(contact_id)
            .await?
            .ok_or_else(|| HandoffError::ContactNotFound(contact_id.clone()))?;
        if contact.status == RoutingStatus::Closed {
            return Err(HandoffError::ContactClosed(contact_id.clone()));
        }
        let now = self.clock.now();
        let resumed = contact
            .resume_automation(now)
            .ok_or_else(|| HandoffError::NotEscalated(contact_id.clone()))?;
        self.contacts.put_contact(&contact).await?;
        self.circular.clear(contact_id);

        self.events.publish(HandoffEvent::EscalationReset {
            contact_id: contact_id.clone(),
            resumed_agent: resumed,
            timestamp: now,
        });
        info!(contact = %contact_id, agent = %resumed, "Escalation cleared; automated routing resumed");
        Ok(contact.status_view())
    }

    /// Close and archive a conversation; closing twice is a no-op
    pub async fn close_contact(&self, contact_id: &ContactId) -> HandoffResult<ContactStatus> {
        let guard = self.admin_lock(contact_id).await?;
        let result = self.close_locked(contact_id).await;
        self.release(guard).await;
        result
    }

    async fn close_locked(&self, contact_id: &ContactId) -> HandoffResult<ContactStatus> {
        let mut contact = self
            .contacts
            .get_contact(contact_id)
            .await?
            .ok_or_else(|| HandoffError::ContactNotFound(contact_id.clone()))?;
        if contact.status == RoutingStatus::Closed {
            return Ok(contact.status_view());
        }
        let now = self.clock.now();
        contact.close(now);
        self.contacts.put_contact(&contact).await?;
        self.circular.clear(contact_id);
        self.packager.discard(contact_id);

        self.events.publish(HandoffEvent::ContactClosed {
            contact_id: contact_id.clone(),
            timestamp: now,
        });
        info!(contact = %contact_id, "Contact closed");
        Ok(contact.status_view())
    }

    async fn admin_lock(&self, contact_id: &ContactId) -> HandoffResult<ContactLockGuard> {
        match self.locks.acquire(contact_id).await? {
            LockAcquisition::Acquired(guard) => Ok(guard),
            LockAcquisition::Contended { .. } => Err(HandoffError::LockContended(contact_id.clone())),
        }
    }

    /// Pull the staged package as `agent`; read-once
    pub fn claim_context(&self, contact_id: &ContactId, agent: AgentKind) -> ClaimOutcome {
        self.packager.claim(contact_id, agent, self.clock.now())
    }

    /// Report how an executed handoff turned out
    pub fn record_feedback(&self, transition_id: Uuid, feedback: HandoffFeedback) -> HandoffResult<()> {
        self.feedback_tx
            .try_send(FeedbackSignal {
                transition_id,
                feedback,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    HandoffError::BackendUnavailable("feedback queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    HandoffError::BackendUnavailable("pattern learner stopped".into())
                }
            })
    }

    /// Sweep per-contact state that has aged out: expired packages and idle
    /// version counters, cooled-down guard entries, stale feedback, rate
    /// windows past the daily retention, lapsed leases and quiet contention
    /// windows. Returns how many entries were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let retain = RateLimiter::retention();
        let packages = self.packager.purge_expired(now, retain);
        let circular = self.circular.prune(now);
        let pending = self.learner.prune_pending(now);
        let rate = self.rate_limiter.purge(now).await;
        let locks = self.locks.purge(now, retain).await;

        let total = packages + circular + pending + rate + locks;
        if total > 0 {
            debug!(packages, circular, pending, rate, locks, "Purged expired coordinator state");
        }
        total
    }

    /// Live audit stream
    pub fn subscribe(&self) -> broadcast::Receiver<HandoffEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.events
    }

    /// Query interface over the transition log
    pub fn history(&self) -> TransitionHistory {
        TransitionHistory::new(self.contacts.clone(), self.clock.clone())
    }

    pub fn health_registry(&self) -> &SharedHealthRegistry {
        &self.health
    }

    pub fn learner(&self) -> &SharedPatternLearner {
        &self.learner
    }

    pub fn lock_manager(&self) -> &SharedLockManager {
        &self.locks
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn gate_timeout(&self) -> StdDuration {
        self.config.deadlines.gate_timeout()
    }

    fn delivery_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.config.lock.lease_ttl_ms)
    }

    fn ownership_mismatch(contact: &Contact, candidate: &HandoffCandidate) -> Option<RejectionReason> {
        match contact.status {
            RoutingStatus::Closed => Some(RejectionReason::Closed),
            RoutingStatus::Escalated { .. } => Some(RejectionReason::Escalated),
            RoutingStatus::Active { agent } if agent != candidate.source_agent => {
                Some(RejectionReason::StaleSource { current: agent })
            }
            RoutingStatus::Active { .. } => None,
        }
    }

    async fn load_or_create(&self, contact_id: &ContactId, now: DateTime<Utc>) -> Result<Contact, StoreError> {
        if let Some(contact) = bounded(self.gate_timeout(), self.contacts.get_contact(contact_id)).await? {
            return Ok(contact);
        }
        let fresh = Contact::new(contact_id.clone(), self.config.routing.entry_agent, now);
        let stored = bounded(self.gate_timeout(), self.contacts.insert_contact_if_absent(&fresh)).await?;
        if stored == fresh {
            debug!(contact = %contact_id, agent = %fresh.active_agent, "Contact created");
            self.events.publish(HandoffEvent::ContactCreated {
                contact_id: contact_id.clone(),
                agent: fresh.active_agent,
                timestamp: now,
            });
        }
        Ok(stored)
    }

    /// Append and publish a record for a decision made without the lock
    async fn finalize(&self, candidate: &HandoffCandidate, outcome: TransitionOutcome) -> Option<TransitionRecord> {
        let record = TransitionRecord::for_candidate(candidate, outcome, self.clock.now());
        match bounded(self.gate_timeout(), self.contacts.append_transition(&record)).await {
            Ok(()) => {
                self.events.publish(HandoffEvent::TransitionRecorded {
                    record: record.clone(),
                });
                Some(record)
            }
            Err(e) => {
                warn!(contact = %candidate.contact_id, %outcome, error = %e, "Failed to record rejected transition");
                self.publish_degraded("contact_store", e.to_string());
                None
            }
        }
    }

    /// Append a record for a decision that already mutated ownership
    async fn append_locked(&self, record: &TransitionRecord) {
        if let Err(e) = bounded(self.gate_timeout(), self.contacts.append_transition(record)).await {
            error!(
                contact = %record.contact_id,
                outcome = %record.outcome,
                error = %e,
                "Ownership changed but the transition log append failed"
            );
            self.publish_degraded("contact_store", e.to_string());
        }
    }

    async fn rate_blocked(&self, candidate: &HandoffCandidate, verdict: RateVerdict) -> Decision {
        let reason = match verdict {
            RateVerdict::Exceeded(window) => {
                debug!(contact = %candidate.contact_id, %window, "Handoff rate limited");
                RejectionReason::RateLimited { window }
            }
            RateVerdict::Unavailable { cause } => {
                error!(contact = %candidate.contact_id, %cause, "Rate counters unavailable and burst spent; failing closed");
                self.publish_degraded("rate_limiter", cause.clone());
                RejectionReason::BackendUnavailable { detail: cause }
            }
            RateVerdict::Within | RateVerdict::DegradedWithin { .. } => {
                return Decision::rejected(
                    RejectionReason::BackendUnavailable {
                        detail: "rate verdict permits handoff".into(),
                    },
                    None,
                )
            }
        };
        let record = self.finalize(candidate, TransitionOutcome::BlockedRateLimit).await;
        Decision::rejected(reason, record)
    }

    async fn circular_blocked(&self, candidate: &HandoffCandidate, now: DateTime<Utc>) -> Option<Decision> {
        let previous = self.circular.conflicting(
            &candidate.contact_id,
            candidate.source_agent,
            candidate.target_agent,
            now,
        )?;
        debug!(
            contact = %candidate.contact_id,
            source = %candidate.source_agent,
            target = %candidate.target_agent,
            "Circular handoff blocked"
        );
        let record = self.finalize(candidate, TransitionOutcome::BlockedCircular).await;
        Some(Decision::rejected(
            RejectionReason::Circular {
                previous_source: previous.source,
                previous_target: previous.target,
                decided_at: previous.decided_at,
            },
            record,
        ))
    }

    fn backend_down(&self, component: &str, contact_id: &ContactId, e: StoreError) -> Decision {
        error!(contact = %contact_id, component, error = %e, "Backend unavailable; failing closed");
        self.publish_degraded(component, e.to_string());
        Decision::rejected(
            RejectionReason::BackendUnavailable {
                detail: e.to_string(),
            },
            None,
        )
    }

    fn publish_degraded(&self, component: &str, error: String) {
        self.events.publish(HandoffEvent::BackendDegraded {
            component: component.to_string(),
            error,
            timestamp: self.clock.now(),
        });
    }

    async fn release(&self, guard: ContactLockGuard) {
        let contact = guard.contact().clone();
        if let Err(e) = guard.release().await {
            warn!(contact = %contact, error = %e, "Failed to release contact lock; lease will lapse");
        }
    }

    async fn deliver(&self, package: &ContextPackage) {
        let tags = handoff_tags(&self.config.tags, package.source_agent, package.target_agent);
        let sent = tokio::time::timeout(
            self.delivery_timeout(),
            self.messaging
                .deliver_context(&package.contact_id, package.target_agent, package, &tags),
        )
        .await;
        let failure = match sent {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(MessagingError::Timeout(self.config.lock.lease_ttl_ms).to_string()),
        };
        let timestamp = self.clock.now();
        match failure {
            None => {
                self.events.publish(HandoffEvent::ContextDelivered {
                    contact_id: package.contact_id.clone(),
                    package_id: package.id,
                    target_agent: package.target_agent,
                    version: package.version,
                    timestamp,
                });
            }
            Some(error) => {
                warn!(
                    contact = %package.contact_id,
                    target = %package.target_agent,
                    %error,
                    "Context delivery failed; package stays claimable"
                );
                self.events.publish(HandoffEvent::ContextDeliveryFailed {
                    contact_id: package.contact_id.clone(),
                    package_id: package.id,
                    target_agent: package.target_agent,
                    error,
                    timestamp,
                });
            }
        }
    }

    async fn notify_escalation(&self, contact_id: &ContactId, from: AgentKind, reason: EscalationReason) {
        let sent = tokio::time::timeout(
            self.delivery_timeout(),
            self.messaging.notify_escalation(contact_id, from, reason),
        )
        .await;
        let error = match sent {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => MessagingError::Timeout(self.config.lock.lease_ttl_ms).to_string(),
        };
        warn!(contact = %contact_id, %error, "Escalation notice not delivered");
        self.publish_degraded("messaging", error);
    }
}
