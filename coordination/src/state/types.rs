//! Core types for handoff state
//!
//! These types are stored by the [`ContactStore`](super::store::ContactStore)
//! and flow through the audit stream. A contact owns exactly one
//! [`RoutingStatus`] at a time; only the coordinator, while holding the
//! contact lock, replaces it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable external key for a conversation owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(String);

impl ContactId {
    /// Wrap an external contact key
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContactId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Coarse class of the signal that produced a candidate (e.g. `budget_mention`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalType(String);

impl SignalType {
    /// Wrap a signal class name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the raw name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SignalType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Agents that can own a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Qualifies inbound leads
    Lead,
    /// Works buyer conversations
    Buyer,
    /// Works seller conversations
    Seller,
    /// Human operator; terminal for automated routing
    Human,
}

impl AgentKind {
    /// Agents that take part in automated routing
    pub fn automated() -> &'static [AgentKind] {
        &[AgentKind::Lead, AgentKind::Buyer, AgentKind::Seller]
    }

    /// Every agent kind, human included
    pub fn all() -> &'static [AgentKind] {
        &[
            AgentKind::Lead,
            AgentKind::Buyer,
            AgentKind::Seller,
            AgentKind::Human,
        ]
    }

    /// Whether this agent is a bot rather than the human operator
    pub fn is_automated(&self) -> bool {
        !matches!(self, AgentKind::Human)
    }

    /// Title-case label used in CRM tags
    pub fn label(&self) -> &'static str {
        match self {
            AgentKind::Lead => "Lead",
            AgentKind::Buyer => "Buyer",
            AgentKind::Seller => "Seller",
            AgentKind::Human => "Human",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Lead => write!(f, "lead"),
            AgentKind::Buyer => write!(f, "buyer"),
            AgentKind::Seller => write!(f, "seller"),
            AgentKind::Human => write!(f, "human"),
        }
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lead" => Ok(AgentKind::Lead),
            "buyer" => Ok(AgentKind::Buyer),
            "seller" => Ok(AgentKind::Seller),
            "human" => Ok(AgentKind::Human),
            other => Err(format!("unknown agent kind '{}'", other)),
        }
    }
}

/// Automated-routing state of a contact
///
/// ```text
/// Active(agent) ──allowed──▶ Active(new_agent)
/// Active(agent) ──depth exceeded──▶ Escalated   (manual reset only)
/// any ──closed externally──▶ Closed            (terminal, archived)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RoutingStatus {
    /// An automated agent owns the conversation
    Active { agent: AgentKind },
    /// A human operator owns the conversation
    Escalated {
        /// Agent that owned the conversation when it escalated
        from: AgentKind,
    },
    /// Conversation closed and archived
    Closed,
}

impl RoutingStatus {
    /// Whether candidates may still be evaluated for this contact
    pub fn is_routable(&self) -> bool {
        matches!(self, RoutingStatus::Active { .. })
    }
}

/// The conversation owner unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Stable external key
    pub contact_id: ContactId,
    /// Current owner
    pub active_agent: AgentKind,
    /// Routing state machine position
    pub status: RoutingStatus,
    /// Executed automated handoffs since the last terminal state
    pub handoff_chain_depth: u32,
    /// When ownership last moved
    pub last_transition_at: Option<DateTime<Utc>>,
    /// First inbound signal
    pub created_at: DateTime<Utc>,
    /// Set when the conversation closes
    pub archived_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// A fresh contact owned by `agent`
    pub fn new(contact_id: ContactId, agent: AgentKind, now: DateTime<Utc>) -> Self {
        Self {
            contact_id,
            active_agent: agent,
            status: RoutingStatus::Active { agent },
            handoff_chain_depth: 0,
            last_transition_at: None,
            created_at: now,
            archived_at: None,
        }
    }

    /// Move ownership to `target` after an executed automated handoff
    pub fn transfer_to(&mut self, target: AgentKind, now: DateTime<Utc>) {
        self.active_agent = target;
        self.status = RoutingStatus::Active { agent: target };
        self.handoff_chain_depth += 1;
        self.last_transition_at = Some(now);
    }

    /// Hand the conversation to the human operator
    pub fn escalate(&mut self, now: DateTime<Utc>) {
        let from = self.active_agent;
        self.active_agent = AgentKind::Human;
        self.status = RoutingStatus::Escalated { from };
        self.handoff_chain_depth = 0;
        self.last_transition_at = Some(now);
    }

    /// Return an escalated contact to the agent it escalated from
    pub fn resume_automation(&mut self, now: DateTime<Utc>) -> Option<AgentKind> {
        let RoutingStatus::Escalated { from } = self.status else {
            return None;
        };
        self.active_agent = from;
        self.status = RoutingStatus::Active { agent: from };
        self.handoff_chain_depth = 0;
        self.last_transition_at = Some(now);
        Some(from)
    }

    /// Close and archive the conversation
    pub fn close(&mut self, now: DateTime<Utc>) {
        self.status = RoutingStatus::Closed;
        self.handoff_chain_depth = 0;
        self.archived_at = Some(now);
    }

    /// Read-only status view
    pub fn status_view(&self) -> ContactStatus {
        ContactStatus {
            contact_id: self.contact_id.clone(),
            active_agent: self.active_agent,
            chain_depth: self.handoff_chain_depth,
            escalated: matches!(self.status, RoutingStatus::Escalated { .. }),
            closed: matches!(self.status, RoutingStatus::Closed),
            last_transition_at: self.last_transition_at,
        }
    }
}

/// Answer to `GetContactStatus`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactStatus {
    pub contact_id: ContactId,
    pub active_agent: AgentKind,
    pub chain_depth: u32,
    pub escalated: bool,
    pub closed: bool,
    pub last_transition_at: Option<DateTime<Utc>>,
}

/// Ephemeral input to a handoff decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffCandidate {
    /// Conversation this candidate concerns
    pub contact_id: ContactId,
    /// Agent that believes it should hand off (must be the current owner)
    pub source_agent: AgentKind,
    /// Proposed new owner
    pub target_agent: AgentKind,
    /// Classifier confidence in `[0, 1]`
    pub confidence: f64,
    /// Signal class used to key learned thresholds
    pub signal_type: SignalType,
    /// Short excerpt of the triggering message, for audit only
    #[serde(default)]
    pub signal_excerpt: String,
    /// When the inbound message was observed
    pub observed_at: DateTime<Utc>,
}

impl HandoffCandidate {
    /// Create a candidate observed at `observed_at`
    pub fn new(
        contact_id: impl Into<ContactId>,
        source_agent: AgentKind,
        target_agent: AgentKind,
        confidence: f64,
        signal_type: impl Into<SignalType>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            contact_id: contact_id.into(),
            source_agent,
            target_agent,
            confidence,
            signal_type: signal_type.into(),
            signal_excerpt: String::new(),
            observed_at,
        }
    }

    /// Attach the triggering message excerpt
    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.signal_excerpt = excerpt.into();
        self
    }

    /// Structural checks that do not need contact state
    pub fn validate(&self) -> Result<(), String> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if self.source_agent == self.target_agent {
            return Err(format!("source and target are both {}", self.source_agent));
        }
        if !self.source_agent.is_automated() {
            return Err("human operator cannot propose automated handoffs".to_string());
        }
        Ok(())
    }
}

impl From<String> for ContactId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<String> for SignalType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Result recorded for every finalized decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// Ownership moved to the target agent
    Executed,
    /// Ownership moved to the human operator on request
    Escalated,
    /// Confidence below the effective threshold
    BlockedThreshold,
    /// Hourly/daily/route cap reached, or counters unavailable above burst
    BlockedRateLimit,
    /// Pair (or its reverse) fired within the cooldown window
    BlockedCircular,
    /// Target agent degraded; candidate deferred
    BlockedUnhealthy,
    /// Chain depth reached; contact escalated to human
    BlockedDepth,
}

impl TransitionOutcome {
    /// Whether ownership changed as a result of this decision
    pub fn moved_ownership(&self) -> bool {
        matches!(
            self,
            TransitionOutcome::Executed | TransitionOutcome::Escalated | TransitionOutcome::BlockedDepth
        )
    }
}

impl std::fmt::Display for TransitionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransitionOutcome::Executed => "executed",
            TransitionOutcome::Escalated => "escalated",
            TransitionOutcome::BlockedThreshold => "blocked_threshold",
            TransitionOutcome::BlockedRateLimit => "blocked_rate_limit",
            TransitionOutcome::BlockedCircular => "blocked_circular",
            TransitionOutcome::BlockedUnhealthy => "blocked_unhealthy",
            TransitionOutcome::BlockedDepth => "blocked_depth",
        };
        f.write_str(s)
    }
}

/// Append-only history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: Uuid,
    pub contact_id: ContactId,
    pub source_agent: AgentKind,
    pub target_agent: AgentKind,
    pub signal_type: SignalType,
    pub confidence: f64,
    pub decided_at: DateTime<Utc>,
    pub outcome: TransitionOutcome,
}

impl TransitionRecord {
    /// Record a decision about `candidate`
    pub fn for_candidate(
        candidate: &HandoffCandidate,
        outcome: TransitionOutcome,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id: candidate.contact_id.clone(),
            source_agent: candidate.source_agent,
            target_agent: candidate.target_agent,
            signal_type: candidate.signal_type.clone(),
            confidence: candidate.confidence,
            decided_at,
            outcome,
        }
    }
}

/// Key under which outcomes are aggregated for threshold learning
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternKey {
    pub signal_type: SignalType,
    pub target_agent: AgentKind,
}

impl PatternKey {
    pub fn new(signal_type: SignalType, target_agent: AgentKind) -> Self {
        Self {
            signal_type,
            target_agent,
        }
    }
}

impl std::fmt::Display for PatternKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.signal_type, self.target_agent)
    }
}

/// Aggregated outcome counters for one [`PatternKey`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStat {
    pub key: PatternKey,
    /// Executed handoffs whose outcome is known
    pub sample_count: u64,
    /// Of those, how many progressed the conversation
    pub success_count: u64,
    /// Route threshold of the first observed handoff; adjustments start here
    pub base_threshold: f64,
    /// Learned threshold for routes whose vetted value is `base_threshold`
    pub effective_threshold: f64,
    pub updated_at: DateTime<Utc>,
}

impl PatternStat {
    /// Fresh counters starting at the route threshold `base`
    pub fn new(key: PatternKey, base: f64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            sample_count: 0,
            success_count: 0,
            base_threshold: base,
            effective_threshold: base,
            updated_at: now,
        }
    }

    /// Learned offset from the base threshold, before clamping
    pub fn adjustment(&self, target_precision: f64, gain: f64) -> f64 {
        let rate = self.success_rate().unwrap_or(target_precision);
        (target_precision - rate) * gain
    }

    /// Observed precision; `None` before any sample
    pub fn success_rate(&self) -> Option<f64> {
        (self.sample_count > 0).then(|| self.success_count as f64 / self.sample_count as f64)
    }
}
