//! Transition history queries and replay
//!
//! Reads the append-only TransitionRecord log in the [`ContactStore`]; the
//! broadcast bus only carries live events.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::HandoffResult;
use crate::state::{ContactId, SharedClock, SharedContactStore, TransitionOutcome, TransitionRecord};

/// Query interface over the transition log
pub struct TransitionHistory {
    store: SharedContactStore,
    clock: SharedClock,
}

impl TransitionHistory {
    pub fn new(store: SharedContactStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// A contact's records in decision order
    pub async fn for_contact(&self, contact: &ContactId) -> HandoffResult<Vec<TransitionRecord>> {
        Ok(self.store.transitions_for(contact).await?)
    }

    /// Records decided in `[start, end)`
    pub async fn between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HandoffResult<Vec<TransitionRecord>> {
        let records = self.store.transitions_between(start, end).await?;
        debug!(count = records.len(), "Retrieved transitions from history");
        Ok(records)
    }

    /// Records from the last `minutes`
    pub async fn recent(&self, minutes: i64) -> HandoffResult<Vec<TransitionRecord>> {
        let end = self.clock.now() + Duration::nanoseconds(1);
        self.between(end - Duration::minutes(minutes), end).await
    }

    /// Feed every record in `[start, end)` through `callback`
    pub async fn replay<F, Fut>(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mut callback: F,
    ) -> HandoffResult<OutcomeStats>
    where
        F: FnMut(TransitionRecord) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let records = self.between(start, end).await?;
        info!(total = records.len(), "Starting transition replay");

        let mut stats = OutcomeStats::default();
        let mut contacts = HashSet::new();
        for record in records {
            stats.record(&record, &mut contacts);
            callback(record).await;
        }

        info!(
            total = stats.total,
            contacts = stats.unique_contacts,
            executed = stats.executed,
            "Transition replay complete"
        );
        Ok(stats)
    }

    /// Outcome breakdown for `[start, end)`
    pub async fn stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HandoffResult<OutcomeStats> {
        let records = self.between(start, end).await?;
        Ok(OutcomeStats::from_records(&records))
    }
}

/// Aggregate outcome counts
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct OutcomeStats {
    pub total: usize,
    pub by_outcome: HashMap<String, usize>,
    pub unique_contacts: usize,
    pub executed: usize,
    pub escalations: usize,
    pub blocked: usize,
}

impl OutcomeStats {
    pub fn from_records(records: &[TransitionRecord]) -> Self {
        let mut stats = Self::default();
        let mut contacts = HashSet::new();
        for r in records {
            stats.record(r, &mut contacts);
        }
        stats
    }

    fn record(&mut self, r: &TransitionRecord, contacts: &mut HashSet<ContactId>) {
        self.total += 1;
        *self.by_outcome.entry(r.outcome.to_string()).or_insert(0) += 1;
        if contacts.insert(r.contact_id.clone()) {
            self.unique_contacts += 1;
        }
        match r.outcome {
            TransitionOutcome::Executed => self.executed += 1,
            TransitionOutcome::Escalated | TransitionOutcome::BlockedDepth => self.escalations += 1,
            _ => {}
        }
        if r.outcome != TransitionOutcome::Executed && r.outcome != TransitionOutcome::Escalated {
            self.blocked += 1;
        }
    }
}
