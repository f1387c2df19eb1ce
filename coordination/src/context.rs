//! Context packages handed to the agent taking ownership
//!
//! A package is a bounded, versioned snapshot of what is known about the
//! conversation. It waits in a per-contact mailbox until the target agent
//! claims it, at most once, or until it expires. An expired package is stale,
//! never an error.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::ContextConfig;
use crate::state::{is_expired, AgentKind, ContactId, Expiring, HandoffCandidate, SignalType};

/// Conversation state supplied by the caller at decision time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSnapshot {
    /// Extracted facts, e.g. `budget`, `timeline`, `preapproved`
    pub structured_facts: BTreeMap<String, serde_json::Value>,
    /// Named rolling scores, e.g. `frs`, `pcs`
    pub rolling_scores: BTreeMap<String, f64>,
}

impl ConversationSnapshot {
    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.structured_facts.insert(key.into(), value.into());
        self
    }

    pub fn with_score(mut self, key: impl Into<String>, value: f64) -> Self {
        self.rolling_scores.insert(key.into(), value);
        self
    }
}

/// Payload transferred on a successful handoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPackage {
    pub id: Uuid,
    /// Per-contact sequence; later packages supersede earlier ones
    pub version: u64,
    pub contact_id: ContactId,
    pub source_agent: AgentKind,
    pub target_agent: AgentKind,
    pub signal_type: SignalType,
    pub structured_facts: BTreeMap<String, serde_json::Value>,
    pub rolling_scores: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ContextPackage {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.expires_at, now)
    }
}

/// Result of a claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "claim", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed { package: ContextPackage },
    /// Package outlived its TTL and was discarded
    Expired { package_id: Uuid },
    /// Waiting package is addressed to another agent; left in place
    NotAddressed { target_agent: AgentKind },
    Empty,
}

/// Builds packages and holds them until claimed
pub struct ContextPackager {
    config: ContextConfig,
    ttl: Duration,
    /// Last version and when it was built
    versions: DashMap<ContactId, (u64, DateTime<Utc>)>,
    mailbox: DashMap<ContactId, Expiring<ContextPackage>>,
}

impl ContextPackager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            ttl: config.ttl(),
            config,
            versions: DashMap::new(),
            mailbox: DashMap::new(),
        }
    }

    /// Snapshot the conversation for `candidate.target_agent`
    pub fn build(
        &self,
        candidate: &HandoffCandidate,
        snapshot: &ConversationSnapshot,
        now: DateTime<Utc>,
    ) -> ContextPackage {
        let version = {
            let mut v = self
                .versions
                .entry(candidate.contact_id.clone())
                .or_insert((0, now));
            *v = (v.0 + 1, now);
            v.0
        };

        // BTreeMap iterates in key order, so truncation is deterministic.
        let structured_facts: BTreeMap<_, _> = snapshot
            .structured_facts
            .iter()
            .take(self.config.max_facts)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let rolling_scores: BTreeMap<_, _> = snapshot
            .rolling_scores
            .iter()
            .filter(|(_, v)| v.is_finite())
            .take(self.config.max_scores)
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let dropped = snapshot.structured_facts.len() - structured_facts.len()
            + snapshot.rolling_scores.len()
            - rolling_scores.len();
        if dropped > 0 {
            debug!(contact = %candidate.contact_id, dropped, "Context snapshot truncated");
        }

        ContextPackage {
            id: Uuid::new_v4(),
            version,
            contact_id: candidate.contact_id.clone(),
            source_agent: candidate.source_agent,
            target_agent: candidate.target_agent,
            signal_type: candidate.signal_type.clone(),
            structured_facts,
            rolling_scores,
            created_at: now,
            expires_at: now + self.ttl,
        }
    }

    /// Leave `package` for its target, superseding any unclaimed one
    pub fn stage(&self, package: ContextPackage) {
        let expires_at = package.expires_at;
        self.mailbox
            .insert(package.contact_id.clone(), Expiring::until(package, expires_at));
    }

    /// Hand the waiting package to `agent`, once
    pub fn claim(&self, contact: &ContactId, agent: AgentKind, now: DateTime<Utc>) -> ClaimOutcome {
        let Some((_, waiting)) = self
            .mailbox
            .remove_if(contact, |_, w| w.is_expired(now) || w.value.target_agent == agent)
        else {
            return match self.mailbox.get(contact) {
                Some(w) => ClaimOutcome::NotAddressed {
                    target_agent: w.value.target_agent,
                },
                None => ClaimOutcome::Empty,
            };
        };

        let package_id = waiting.value.id;
        match waiting.into_live(now) {
            Some(package) => ClaimOutcome::Claimed { package },
            None => {
                debug!(contact = %contact, %package_id, "Context package expired unclaimed");
                ClaimOutcome::Expired { package_id }
            }
        }
    }

    /// Drop any waiting package for `contact`
    pub fn discard(&self, contact: &ContactId) -> bool {
        self.mailbox.remove(contact).is_some()
    }

    /// Drop every expired package, and version counters for contacts with
    /// no package built within `retain` and none waiting. Returns how many
    /// packages were removed.
    ///
    /// A contact idle past `retain` starts again at version 1.
    pub fn purge_expired(&self, now: DateTime<Utc>, retain: Duration) -> usize {
        let before = self.mailbox.len();
        self.mailbox.retain(|_, w| !w.is_expired(now));
        let cutoff = now - retain;
        self.versions
            .retain(|contact, (_, built)| *built > cutoff || self.mailbox.contains_key(contact));
        before - self.mailbox.len()
    }

    /// Contacts with a version counter
    pub fn tracked_contacts(&self) -> usize {
        self.versions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> HandoffCandidate {
        HandoffCandidate::new("c1", AgentKind::Lead, AgentKind::Buyer, 0.85, "budget_mention", Utc::now())
    }

    #[test]
    fn test_build_truncates_deterministically() {
        let packager = ContextPackager::new(ContextConfig {
            max_facts: 2,
            max_scores: 1,
            ..ContextConfig::default()
        });
        let snapshot = ConversationSnapshot::default()
            .with_fact("timeline", "3 months")
            .with_fact("budget", 450_000)
            .with_fact("area", "Rancho")
            .with_score("frs", 72.0)
            .with_score("pcs", 40.0);

        let now = Utc::now();
        let pkg = packager.build(&candidate(), &snapshot, now);
        let keys: Vec<_> = pkg.structured_facts.keys().cloned().collect();
        assert_eq!(keys, vec!["area", "budget"]);
        assert_eq!(pkg.rolling_scores.len(), 1);
        assert!(pkg.rolling_scores.contains_key("frs"));
        assert_eq!(pkg.expires_at, now + Duration::hours(24));
    }

    #[test]
    fn test_versions_increase_per_contact() {
        let packager = ContextPackager::new(ContextConfig::default());
        let snap = ConversationSnapshot::default();
        let now = Utc::now();
        assert_eq!(packager.build(&candidate(), &snap, now).version, 1);
        assert_eq!(packager.build(&candidate(), &snap, now).version, 2);

        let other = HandoffCandidate::new("c2", AgentKind::Lead, AgentKind::Seller, 0.9, "s", now);
        assert_eq!(packager.build(&other, &snap, now).version, 1);
    }

    #[test]
    fn test_claim_is_read_once_and_target_only() {
        let packager = ContextPackager::new(ContextConfig::default());
        let now = Utc::now();
        let pkg = packager.build(&candidate(), &ConversationSnapshot::default(), now);
        packager.stage(pkg.clone());
        let c = ContactId::new("c1");

        assert_eq!(
            packager.claim(&c, AgentKind::Seller, now),
            ClaimOutcome::NotAddressed {
                target_agent: AgentKind::Buyer
            }
        );
        assert_eq!(
            packager.claim(&c, AgentKind::Buyer, now),
            ClaimOutcome::Claimed { package: pkg }
        );
        assert_eq!(packager.claim(&c, AgentKind::Buyer, now), ClaimOutcome::Empty);
    }

    #[test]
    fn test_expired_package_is_stale_not_fatal() {
        let packager = ContextPackager::new(ContextConfig::default());
        let now = Utc::now();
        let pkg = packager.build(&candidate(), &ConversationSnapshot::default(), now);
        let id = pkg.id;
        packager.stage(pkg);

        let later = now + Duration::hours(24);
        assert_eq!(
            packager.claim(&ContactId::new("c1"), AgentKind::Seller, later),
            ClaimOutcome::Expired { package_id: id }
        );
        assert_eq!(
            packager.claim(&ContactId::new("c1"), AgentKind::Buyer, later),
            ClaimOutcome::Empty
        );
    }

    #[test]
    fn test_purge_and_discard() {
        let packager = ContextPackager::new(ContextConfig::default());
        let now = Utc::now();
        let snap = ConversationSnapshot::default();
        packager.stage(packager.build(&candidate(), &snap, now));
        assert!(packager.discard(&ContactId::new("c1")));
        assert!(!packager.discard(&ContactId::new("c1")));

        packager.stage(packager.build(&candidate(), &snap, now));
        assert_eq!(packager.purge_expired(now + Duration::days(2), Duration::days(1)), 1);
        assert_eq!(packager.tracked_contacts(), 0);
    }

    #[test]
    fn test_purge_keeps_recent_and_waiting_versions() {
        let packager = ContextPackager::new(ContextConfig {
            ttl_secs: 3 * 24 * 60 * 60,
            ..ContextConfig::default()
        });
        let now = Utc::now();
        let snap = ConversationSnapshot::default();
        // c1: built long ago, still waiting to be claimed
        packager.stage(packager.build(&candidate(), &snap, now));
        // c2: claimed long ago
        let old = HandoffCandidate::new("c2", AgentKind::Lead, AgentKind::Seller, 0.9, "s", now);
        packager.build(&old, &snap, now);
        // c3: built recently
        let recent = HandoffCandidate::new("c3", AgentKind::Lead, AgentKind::Seller, 0.9, "s", now);
        packager.build(&recent, &snap, now + Duration::hours(47));

        assert_eq!(packager.purge_expired(now + Duration::hours(48), Duration::days(1)), 0);
        assert_eq!(packager.tracked_contacts(), 2);
        assert_eq!(packager.build(&old, &snap, now + Duration::hours(48)).version, 1);
        assert_eq!(packager.build(&candidate(), &snap, now + Duration::hours(48)).version, 2);
    }
}
