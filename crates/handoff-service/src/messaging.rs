//! Messaging layer that records deliveries in the service log
//!
//! Stands in for a CRM integration: every delivery and escalation notice is
//! emitted as a structured tracing event so an operator (or a log shipper)
//! can act on it.

use async_trait::async_trait;
use handoff_coordination::messaging::MessagingResult;
use handoff_coordination::{AgentKind, ContactId, ContextPackage, EscalationReason, MessagingLayer, TagAction};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMessaging;

#[async_trait]
impl MessagingLayer for TracingMessaging {
    async fn deliver_context(
        &self,
        contact: &ContactId,
        target: AgentKind,
        package: &ContextPackage,
        tags: &[TagAction],
    ) -> MessagingResult<()> {
        for tag in tags {
            match tag {
                TagAction::AddTag(t) => info!(contact = %contact, tag = %t, "CRM tag added"),
                TagAction::RemoveTag(t) => info!(contact = %contact, tag = %t, "CRM tag removed"),
            }
        }
        info!(
            contact = %contact,
            target = %target,
            package = %package.id,
            version = package.version,
            facts = package.structured_facts.len(),
            "Context package delivered"
        );
        Ok(())
    }

    async fn notify_escalation(
        &self,
        contact: &ContactId,
        from: AgentKind,
        reason: EscalationReason,
    ) -> MessagingResult<()> {
        warn!(contact = %contact, from = %from, reason = %reason, "Human takeover required");
        Ok(())
    }
}
