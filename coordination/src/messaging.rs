//! Collaborator seams: confidence scoring and messaging/CRM delivery
//!
//! The coordinator never generates text or talks to a CRM directly. It asks a
//! [`ConfidenceScorer`] what an inbound message implies, and tells a
//! [`MessagingLayer`] where the conversation went, which tags to swap, and
//! when a human must take over.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TagConfig;
use crate::context::ContextPackage;
use crate::events::EscalationReason;
use crate::state::{AgentKind, ContactId, ContactStatus, SignalType};

/// Errors from external collaborators
#[derive(Debug, Clone, Error)]
pub enum MessagingError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Scoring failed: {0}")]
    Scoring(String),

    #[error("Collaborator timed out after {0}ms")]
    Timeout(u64),
}

/// Result type for collaborator calls
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Shared reference to a messaging layer
pub type SharedMessaging = Arc<dyn MessagingLayer>;

/// Shared reference to a scorer
pub type SharedScorer = Arc<dyn ConfidenceScorer>;

/// What a scorer concluded about one inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSignal {
    pub target_agent: AgentKind,
    pub confidence: f64,
    pub signal_type: SignalType,
}

/// Intent classifier supplying handoff candidates
#[async_trait]
pub trait ConfidenceScorer: Send + Sync {
    /// `None` when the message carries no handoff signal
    async fn score(&self, message: &str, contact: &ContactStatus) -> MessagingResult<Option<ScoredSignal>>;
}

/// CRM tag mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "tag", rename_all = "snake_case")]
pub enum TagAction {
    AddTag(String),
    RemoveTag(String),
}

/// Tag swap for a move from `source` to `target`
///
/// Removes the source's ownership tag, adds the target's, and adds a
/// `Handoff-<Source>-to-<Target>` marker. Agents sharing a tag keep it.
pub fn handoff_tags(tags: &TagConfig, source: AgentKind, target: AgentKind) -> Vec<TagAction> {
    let from = tags.for_agent(source);
    let to = tags.for_agent(target);
    let mut actions = Vec::with_capacity(3);
    if from != to {
        actions.push(TagAction::RemoveTag(from.to_string()));
        actions.push(TagAction::AddTag(to.to_string()));
    }
    actions.push(TagAction::AddTag(format!(
        "Handoff-{}-to-{}",
        source.label(),
        target.label()
    )));
    actions
}

/// Downstream delivery of handoff effects
#[async_trait]
pub trait MessagingLayer: Send + Sync {
    /// Hand the package to the new owner and apply the tag swap
    async fn deliver_context(
        &self,
        contact: &ContactId,
        target: AgentKind,
        package: &ContextPackage,
        tags: &[TagAction],
    ) -> MessagingResult<()>;

    /// Surface a contact to the human operator
    async fn notify_escalation(
        &self,
        contact: &ContactId,
        from: AgentKind,
        reason: EscalationReason,
    ) -> MessagingResult<()>;
}

/// Messaging layer that accepts everything and does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMessaging;

#[async_trait]
impl MessagingLayer for NullMessaging {
    async fn deliver_context(
        &self,
        _contact: &ContactId,
        _target: AgentKind,
        _package: &ContextPackage,
        _tags: &[TagAction],
    ) -> MessagingResult<()> {
        Ok(())
    }

    async fn notify_escalation(
        &self,
        _contact: &ContactId,
        _from: AgentKind,
        _reason: EscalationReason,
    ) -> MessagingResult<()> {
        Ok(())
    }
}
