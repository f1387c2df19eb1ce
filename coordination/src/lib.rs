//! Handoff Coordination Library
//!
//! Decides when a conversation moves between automated agents (lead, buyer,
//! seller) or to a human operator, and makes that move safely under
//! concurrency.
//!
//! # Components
//!
//! - [`coordinator`]: `HandoffCoordinator::evaluate`, the gate pipeline and
//!   the admin operations (status, escalation reset, close)
//! - [`rate_limit`]: per-contact hourly/daily and per-route sliding windows
//! - [`circular`]: ping-pong cooldown and chain-depth guard
//! - [`registry`]: rolling agent health (P95 latency vs SLA, error rate)
//! - [`lock`]: per-contact leases with acquisition timeout and TTL
//! - [`context`]: bounded context packages, claimable once by the new owner
//! - [`learner`]: per-pattern threshold tuning from outcome feedback
//! - [`messaging`]: scorer and CRM/messaging seams, tag swaps
//! - [`events`]: broadcast audit stream and transition history
//! - [`state`]: contact/transition/pattern storage, TTL store, clocks
//!
//! # Decision flow
//!
//! ```text
//! agent ──candidate──▶ HandoffCoordinator ──▶ Decision
//!                         │  │  │                 allowed | rejected(reason)
//!            ┌────────────┘  │  └─────────┐       contended | deferred
//!            ▼               ▼            ▼
//!     ContactStore    EphemeralStore   EventBus ──▶ PatternLearner
//!   (contacts + log)  (rates, leases)     │
//!                                         └──────▶ audit subscribers
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use handoff_coordination::{AgentKind, HandoffCandidate, HandoffConfig, HandoffCoordinator};
//!
//! # async fn run() -> handoff_coordination::HandoffResult<()> {
//! let coordinator = HandoffCoordinator::builder(HandoffConfig::load(None)?).build()?;
//! coordinator.spawn_learner();
//!
//! let candidate = HandoffCandidate::new(
//!     "contact-42",
//!     AgentKind::Lead,
//!     AgentKind::Buyer,
//!     0.85,
//!     "budget_mention",
//!     chrono::Utc::now(),
//! );
//! let decision = coordinator.evaluate(candidate).await;
//! println!("{}", decision.label());
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod circular;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod learner;
pub mod lock;
pub mod messaging;
pub mod rate_limit;
pub mod registry;
pub mod state;

pub use config::HandoffConfig;
pub use context::{ClaimOutcome, ContextPackage, ConversationSnapshot};
pub use coordinator::{
    Decision, DeferReason, HandoffCoordinator, HandoffCoordinatorBuilder, RejectionReason,
};
pub use error::{HandoffError, HandoffResult};
pub use events::{EscalationReason, EventBus, HandoffEvent, SharedEventBus, TransitionHistory};
pub use learner::{FeedbackSignal, HandoffFeedback, PatternLearner};
pub use messaging::{
    ConfidenceScorer, MessagingError, MessagingLayer, NullMessaging, ScoredSignal, TagAction,
};
pub use rate_limit::RateWindow;
pub use registry::{
    spawn_health_ingest, AgentHealthRegistry, AgentHealthSample, HealthAssessment, HealthReporter,
};
pub use state::{
    AgentKind, Clock, Contact, ContactId, ContactStatus, ContactStore, EphemeralStore,
    HandoffCandidate, InMemoryContactStore, InMemoryEphemeralStore, ManualClock, RoutingStatus,
    SignalType, SystemClock, TransitionOutcome, TransitionRecord,
};

#[cfg(feature = "durable-state")]
pub use state::DurableContactStore;
