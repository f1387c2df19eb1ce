//! Storage seams for handoff state
//!
//! Two kinds of state back the coordinator:
//!
//! - [`ContactStore`]: the durable Contact table, the append-only
//!   TransitionRecord log, and the PatternStat table.
//! - [`EphemeralStore`]: fast shared state with TTL semantics: sliding
//!   rate-limit windows and lock leases.
//!
//! Both are traits so a deployment can put them on a shared backend; the
//! in-memory implementations here serve single-process deployments and tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::expiry::Expiring;
use super::types::{Contact, ContactId, PatternKey, PatternStat, TransitionRecord};

/// Error type for state store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Key not found: {0}")]
    NotFound(String),
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Run one backend call under `limit`; running out of time counts as unavailability
pub async fn bounded<T, F>(limit: std::time::Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "backend call exceeded {}ms",
            limit.as_millis()
        ))),
    }
}

/// Shared reference to a ContactStore
pub type SharedContactStore = Arc<dyn ContactStore>;

/// Shared reference to an EphemeralStore
pub type SharedEphemeralStore = Arc<dyn EphemeralStore>;

/// Contact table, transition log, and pattern table
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Load a contact
    async fn get_contact(&self, id: &ContactId) -> StoreResult<Option<Contact>>;

    /// Insert or replace a contact
    async fn put_contact(&self, contact: &Contact) -> StoreResult<()>;

    /// Insert `contact` unless its id exists; returns the stored contact
    async fn insert_contact_if_absent(&self, contact: &Contact) -> StoreResult<Contact>;

    /// Append a record to the transition log
    async fn append_transition(&self, record: &TransitionRecord) -> StoreResult<()>;

    /// A contact's records in append order
    async fn transitions_for(&self, id: &ContactId) -> StoreResult<Vec<TransitionRecord>>;

    /// All records decided in `[start, end)`, ordered by decision time
    async fn transitions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<TransitionRecord>>;

    /// Insert or replace a pattern row
    async fn put_pattern(&self, stat: &PatternStat) -> StoreResult<()>;

    /// Every pattern row
    async fn load_patterns(&self) -> StoreResult<Vec<PatternStat>>;
}

/// In-process ContactStore
#[derive(Default)]
pub struct InMemoryContactStore {
    contacts: RwLock<HashMap<ContactId, Contact>>,
    transitions: RwLock<Vec<TransitionRecord>>,
    by_contact: RwLock<HashMap<ContactId, Vec<usize>>>,
    patterns: RwLock<HashMap<PatternKey, PatternStat>>,
}

impl InMemoryContactStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedContactStore {
        Arc::new(self)
    }
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn get_contact(&self, id: &ContactId) -> StoreResult<Option<Contact>> {
        Ok(self.contacts.read().await.get(id).cloned())
    }

    async fn put_contact(&self, contact: &Contact) -> StoreResult<()> {
        self.contacts
            .write()
            .await
            .insert(contact.contact_id.clone(), contact.clone());
        Ok(())
    }

    async fn insert_contact_if_absent(&self, contact: &Contact) -> StoreResult<Contact> {
        Ok(self
            .contacts
            .write()
            .await
            .entry(contact.contact_id.clone())
            .or_insert_with(|| contact.clone())
            .clone())
    }

    async fn append_transition(&self, record: &TransitionRecord) -> StoreResult<()> {
        // Lock order: log then index, everywhere.
        let mut log = self.transitions.write().await;
        let mut index = self.by_contact.write().await;
        index
            .entry(record.contact_id.clone())
            .or_default()
            .push(log.len());
        log.push(record.clone());
        Ok(())
    }

    async fn transitions_for(&self, id: &ContactId) -> StoreResult<Vec<TransitionRecord>> {
        let log = self.transitions.read().await;
        let index = self.by_contact.read().await;
        Ok(index
            .get(id)
            .map(|positions| positions.iter().map(|&i| log[i].clone()).collect())
            .unwrap_or_default())
    }

    async fn transitions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<TransitionRecord>> {
        let log = self.transitions.read().await;
        let mut records: Vec<TransitionRecord> = log
            .iter()
            .filter(|r| r.decided_at >= start && r.decided_at < end)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.decided_at);
        Ok(records)
    }

    async fn put_pattern(&self, stat: &PatternStat) -> StoreResult<()> {
        self.patterns
            .write()
            .await
            .insert(stat.key.clone(), stat.clone());
        Ok(())
    }

    async fn load_patterns(&self) -> StoreResult<Vec<PatternStat>> {
        let mut stats: Vec<PatternStat> = self.patterns.read().await.values().cloned().collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(stats)
    }
}

/// One cap over one sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub window: Duration,
    pub cap: u32,
}

/// Fast shared state with TTL semantics
///
/// Every operation is atomic with respect to concurrent calls on the same key.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Count events recorded under `key` within each of `windows` before `now`
    async fn window_counts(
        &self,
        key: &str,
        now: DateTime<Utc>,
        windows: &[Duration],
    ) -> StoreResult<Vec<u32>>;

    /// Record an event at `now` unless a limit is already reached.
    ///
    /// Returns `None` when recorded, or the index into `limits` of the first
    /// limit that blocked it. Events older than `retain` are dropped.
    async fn record_if_within(
        &self,
        key: &str,
        now: DateTime<Utc>,
        retain: Duration,
        limits: &[WindowLimit],
    ) -> StoreResult<Option<usize>>;

    /// Take the lease on `key` if it is free or expired
    async fn acquire_lease(
        &self,
        key: &str,
        token: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Drop the lease on `key` if `token` still holds it
    async fn release_lease(&self, key: &str, token: Uuid) -> StoreResult<bool>;

    /// Drop lapsed leases and windows with no event newer than `retain`.
    ///
    /// Backends that expire keys natively keep the default no-op.
    async fn purge(&self, _now: DateTime<Utc>, _retain: Duration) -> StoreResult<usize> {
        Ok(0)
    }
}

/// In-process EphemeralStore backed by sharded maps
#[derive(Default)]
pub struct InMemoryEphemeralStore {
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    leases: DashMap<String, Expiring<Uuid>>,
}

impl InMemoryEphemeralStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedEphemeralStore {
        Arc::new(self)
    }

    /// Live keys across windows and leases
    pub fn key_count(&self) -> usize {
        self.windows.len() + self.leases.len()
    }
}

fn prune(events: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, retain: Duration) {
    let cutoff = now - retain;
    while events.front().is_some_and(|t| *t <= cutoff) {
        events.pop_front();
    }
}

fn count_within(events: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> u32 {
    let cutoff = now - window;
    events.iter().rev().take_while(|t| **t > cutoff).count() as u32
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn window_counts(
        &self,
        key: &str,
        now: DateTime<Utc>,
        windows: &[Duration],
    ) -> StoreResult<Vec<u32>> {
        Ok(match self.windows.get(key) {
            Some(events) => windows
                .iter()
                .map(|w| count_within(&events, now, *w))
                .collect(),
            None => vec![0; windows.len()],
        })
    }

    async fn record_if_within(
        &self,
        key: &str,
        now: DateTime<Utc>,
        retain: Duration,
        limits: &[WindowLimit],
    ) -> StoreResult<Option<usize>> {
        let mut events = self.windows.entry(key.to_string()).or_default();
        prune(&mut events, now, retain);
        if let Some(blocked) = limits
            .iter()
            .position(|l| count_within(&events, now, l.window) >= l.cap)
        {
            return Ok(Some(blocked));
        }
        events.push_back(now);
        Ok(None)
    }

    async fn acquire_lease(
        &self,
        key: &str,
        token: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<bool> {
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().is_expired(now) {
                    held.insert(Expiring::new(token, now, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(free) => {
                free.insert(Expiring::new(token, now, ttl));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, key: &str, token: Uuid) -> StoreResult<bool> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.value == token)
            .is_some())
    }

    async fn purge(&self, now: DateTime<Utc>, retain: Duration) -> StoreResult<usize> {
        let before = self.key_count();
        self.leases.retain(|_, lease| !lease.is_expired(now));
        self.windows.retain(|_, events| {
            prune(events, now, retain);
            !events.is_empty()
        });
        Ok(before - self.key_count())
    }
}
