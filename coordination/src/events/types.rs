//! Event types for the handoff audit stream
//!
//! Every finalized decision is published as [`HandoffEvent::TransitionRecorded`];
//! the other variants cover ownership changes made outside the gate pipeline
//! and infrastructure signals operators care about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{AgentKind, ContactId, TransitionRecord};

/// Why a contact left automated routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Chain depth reached `max_depth`
    DepthExceeded,
    /// A candidate targeted the human operator
    Requested,
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationReason::DepthExceeded => write!(f, "depth_exceeded"),
            EscalationReason::Requested => write!(f, "requested"),
        }
    }
}

/// All handoff events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandoffEvent {
    /// A decision was appended to the transition log
    TransitionRecorded { record: TransitionRecord },

    /// First inbound signal for a contact
    ContactCreated {
        contact_id: ContactId,
        agent: AgentKind,
        timestamp: DateTime<Utc>,
    },

    /// Contact handed to the human operator
    ContactEscalated {
        contact_id: ContactId,
        from: AgentKind,
        reason: EscalationReason,
        timestamp: DateTime<Utc>,
    },

    /// Operator returned the contact to automated routing
    EscalationReset {
        contact_id: ContactId,
        resumed_agent: AgentKind,
        timestamp: DateTime<Utc>,
    },

    /// Conversation closed and archived
    ContactClosed {
        contact_id: ContactId,
        timestamp: DateTime<Utc>,
    },

    /// Messaging layer acknowledged a context package
    ContextDelivered {
        contact_id: ContactId,
        package_id: Uuid,
        target_agent: AgentKind,
        version: u64,
        timestamp: DateTime<Utc>,
    },

    /// Messaging layer rejected a context package; the handoff stands
    ContextDeliveryFailed {
        contact_id: ContactId,
        package_id: Uuid,
        target_agent: AgentKind,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A backend failed and a component fell back or failed closed
    BackendDegraded {
        component: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Contact lock was contended
    LockContention {
        contact_id: ContactId,
        recent: u32,
        timestamp: DateTime<Utc>,
    },

    /// Target health could not be judged and was treated as healthy
    HealthUnknown {
        agent: AgentKind,
        fresh_samples: usize,
        timestamp: DateTime<Utc>,
    },
}

impl HandoffEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HandoffEvent::TransitionRecorded { record } => record.decided_at,
            HandoffEvent::ContactCreated { timestamp, .. }
            | HandoffEvent::ContactEscalated { timestamp, .. }
            | HandoffEvent::EscalationReset { timestamp, .. }
            | HandoffEvent::ContactClosed { timestamp, .. }
            | HandoffEvent::ContextDelivered { timestamp, .. }
            | HandoffEvent::ContextDeliveryFailed { timestamp, .. }
            | HandoffEvent::BackendDegraded { timestamp, .. }
            | HandoffEvent::LockContention { timestamp, .. }
            | HandoffEvent::HealthUnknown { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            HandoffEvent::TransitionRecorded { .. } => "transition_recorded",
            HandoffEvent::ContactCreated { .. } => "contact_created",
            HandoffEvent::ContactEscalated { .. } => "contact_escalated",
            HandoffEvent::EscalationReset { .. } => "escalation_reset",
            HandoffEvent::ContactClosed { .. } => "contact_closed",
            HandoffEvent::ContextDelivered { .. } => "context_delivered",
            HandoffEvent::ContextDeliveryFailed { .. } => "context_delivery_failed",
            HandoffEvent::BackendDegraded { .. } => "backend_degraded",
            HandoffEvent::LockContention { .. } => "lock_contention",
            HandoffEvent::HealthUnknown { .. } => "health_unknown",
        }
    }

    /// Get the contact ID if this event is contact-scoped
    pub fn contact_id(&self) -> Option<&ContactId> {
        match self {
            HandoffEvent::TransitionRecorded { record } => Some(&record.contact_id),
            HandoffEvent::ContactCreated { contact_id, .. }
            | HandoffEvent::ContactEscalated { contact_id, .. }
            | HandoffEvent::EscalationReset { contact_id, .. }
            | HandoffEvent::ContactClosed { contact_id, .. }
            | HandoffEvent::ContextDelivered { contact_id, .. }
            | HandoffEvent::ContextDeliveryFailed { contact_id, .. }
            | HandoffEvent::LockContention { contact_id, .. } => Some(contact_id),
            HandoffEvent::BackendDegraded { .. } | HandoffEvent::HealthUnknown { .. } => None,
        }
    }

    /// The record carried by a `TransitionRecorded` event
    pub fn record(&self) -> Option<&TransitionRecord> {
        match self {
            HandoffEvent::TransitionRecorded { record } => Some(record),
            _ => None,
        }
    }
}
