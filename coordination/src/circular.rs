//! Circular-transition guard
//!
//! Keeps, per contact, the executed handoffs still inside the cooldown
//! window. A candidate is circular when the same pair, or its reverse, fired
//! within that window:
//!
//! ```text
//! Lead ──▶ Buyer        (executed at t)
//! Buyer ──▶ Lead        (t + 5m)   circular: reverse pair
//! Lead ──▶ Buyer        (t + 5m)   circular: identical pair
//! Buyer ──▶ Lead        (t + 31m)  allowed
//! ```
//!
//! Chain depth lives on the [`Contact`] itself; the guard only compares it
//! against `max_depth`.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::config::CircularConfig;
use crate::state::{AgentKind, Contact, ContactId, TransitionOutcome, TransitionRecord};

/// One executed handoff still inside the cooldown window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecentTransition {
    pub source: AgentKind,
    pub target: AgentKind,
    pub decided_at: DateTime<Utc>,
}

impl RecentTransition {
    fn collides_with(&self, source: AgentKind, target: AgentKind) -> bool {
        (self.source == source && self.target == target)
            || (self.source == target && self.target == source)
    }
}

/// Ping-pong and depth protection
pub struct CircularGuard {
    recent: DashMap<ContactId, VecDeque<RecentTransition>>,
    cooldown: Duration,
    max_depth: u32,
}

impl CircularGuard {
    pub fn new(config: &CircularConfig) -> Self {
        Self {
            recent: DashMap::new(),
            cooldown: config.cooldown(),
            max_depth: config.max_depth,
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// The earlier transition that makes `source → target` circular, if any
    pub fn conflicting(
        &self,
        contact: &ContactId,
        source: AgentKind,
        target: AgentKind,
        now: DateTime<Utc>,
    ) -> Option<RecentTransition> {
        let cutoff = now - self.cooldown;
        self.recent.get(contact).and_then(|history| {
            history
                .iter()
                .rev()
                .take_while(|t| t.decided_at > cutoff)
                .find(|t| t.collides_with(source, target))
                .copied()
        })
    }

    pub fn is_circular(
        &self,
        contact: &ContactId,
        source: AgentKind,
        target: AgentKind,
        now: DateTime<Utc>,
    ) -> bool {
        self.conflicting(contact, source, target, now).is_some()
    }

    /// Whether another automated handoff would exceed the chain bound
    pub fn depth_exceeded(&self, contact: &Contact) -> bool {
        contact.handoff_chain_depth >= self.max_depth
    }

    /// Remember an executed handoff
    pub fn record(&self, contact: &ContactId, source: AgentKind, target: AgentKind, at: DateTime<Utc>) {
        let cutoff = at - self.cooldown;
        let mut history = self.recent.entry(contact.clone()).or_default();
        while history.front().is_some_and(|t| t.decided_at <= cutoff) {
            history.pop_front();
        }
        history.push_back(RecentTransition {
            source,
            target,
            decided_at: at,
        });
    }

    /// Forget a contact's history after escalation, reset, or close
    pub fn clear(&self, contact: &ContactId) {
        self.recent.remove(contact);
    }

    /// Rebuild state from the transition log (e.g. after a restart)
    pub fn hydrate<'a>(&self, records: impl IntoIterator<Item = &'a TransitionRecord>) -> usize {
        let mut loaded = 0;
        for r in records {
            if r.outcome == TransitionOutcome::Executed {
                self.record(&r.contact_id, r.source_agent, r.target_agent, r.decided_at);
                loaded += 1;
            }
        }
        loaded
    }

    /// Drop contacts whose whole history has left the window
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.cooldown;
        let before = self.recent.len();
        self.recent
            .retain(|_, history| history.back().is_some_and(|t| t.decided_at > cutoff));
        before - self.recent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HandoffCandidate;

    fn guard() -> CircularGuard {
        CircularGuard::new(&CircularConfig::default())
    }

    #[test]
    fn test_reverse_pair_is_circular_within_cooldown() {
        let g = guard();
        let c = ContactId::new("c1");
        let t0 = Utc::now();
        g.record(&c, AgentKind::Lead, AgentKind::Buyer, t0);

        assert!(g.is_circular(&c, AgentKind::Buyer, AgentKind::Lead, t0 + Duration::minutes(5)));
        assert!(g.is_circular(&c, AgentKind::Lead, AgentKind::Buyer, t0 + Duration::minutes(29)));
        assert!(!g.is_circular(&c, AgentKind::Buyer, AgentKind::Lead, t0 + Duration::minutes(30)));
    }

    #[test]
    fn test_unrelated_pair_and_contact_not_circular() {
        let g = guard();
        let c = ContactId::new("c1");
        let t0 = Utc::now();
        g.record(&c, AgentKind::Lead, AgentKind::Buyer, t0);

        assert!(!g.is_circular(&c, AgentKind::Buyer, AgentKind::Seller, t0));
        assert!(!g.is_circular(&ContactId::new("c2"), AgentKind::Buyer, AgentKind::Lead, t0));
    }

    #[test]
    fn test_depth_bound() {
        let g = guard();
        let mut contact = Contact::new("c1".into(), AgentKind::Lead, Utc::now());
        for target in [AgentKind::Buyer, AgentKind::Seller] {
            contact.transfer_to(target, Utc::now());
            assert!(!g.depth_exceeded(&contact));
        }
        contact.transfer_to(AgentKind::Buyer, Utc::now());
        assert!(g.depth_exceeded(&contact));
        contact.escalate(Utc::now());
        assert!(!g.depth_exceeded(&contact));
    }

    #[test]
    fn test_clear_forgets_history() {
        let g = guard();
        let c = ContactId::new("c1");
        let t0 = Utc::now();
        g.record(&c, AgentKind::Lead, AgentKind::Buyer, t0);
        g.clear(&c);
        assert!(!g.is_circular(&c, AgentKind::Buyer, AgentKind::Lead, t0));
    }

    #[test]
    fn test_hydrate_only_loads_executed() {
        let g = guard();
        let t0 = Utc::now();
        let cand = HandoffCandidate::new("c1", AgentKind::Lead, AgentKind::Buyer, 0.9, "s", t0);
        let records = vec![
            TransitionRecord::for_candidate(&cand, TransitionOutcome::BlockedThreshold, t0),
            TransitionRecord::for_candidate(&cand, TransitionOutcome::Executed, t0),
        ];
        assert_eq!(g.hydrate(&records), 1);
        assert!(g.is_circular(&ContactId::new("c1"), AgentKind::Buyer, AgentKind::Lead, t0));
    }

    #[test]
    fn test_prune_drops_stale_contacts() {
        let g = guard();
        let t0 = Utc::now();
        g.record(&ContactId::new("old"), AgentKind::Lead, AgentKind::Buyer, t0);
        g.record(
            &ContactId::new("new"),
            AgentKind::Lead,
            AgentKind::Buyer,
            t0 + Duration::minutes(20),
        );
        assert_eq!(g.prune(t0 + Duration::minutes(31)), 1);
    }
}
