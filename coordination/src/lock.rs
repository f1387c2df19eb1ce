//! Contact Lock Manager
//!
//! A lease per contact in the [`EphemeralStore`]: set if absent or expired,
//! deleted only by the token that set it. A crashed holder blocks the contact
//! for at most one lease TTL.
//!
//! Acquisition polls with capped exponential backoff until the acquisition
//! timeout. Contention is not an error; callers get
//! [`LockAcquisition::Contended`] and may retry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::state::{bounded, ContactId, SharedClock, SharedEphemeralStore, StoreResult};

const INITIAL_BACKOFF: StdDuration = StdDuration::from_millis(5);
const MAX_BACKOFF: StdDuration = StdDuration::from_millis(50);

/// Outcome of an acquisition attempt
#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(ContactLockGuard),
    /// Someone else holds the lease; `recent` counts contentions on this
    /// contact inside the contention window
    Contended { recent: u32 },
}

/// Held lease on one contact
pub struct ContactLockGuard {
    contact: ContactId,
    key: String,
    token: Uuid,
    store: SharedEphemeralStore,
    released: bool,
}

impl ContactLockGuard {
    pub fn contact(&self) -> &ContactId {
        &self.contact
    }

    /// Give the lease back; false if it had already lapsed to someone else
    pub async fn release(mut self) -> StoreResult<bool> {
        self.released = true;
        let held = self.store.release_lease(&self.key, self.token).await?;
        if !held {
            warn!(contact = %self.contact, "Lock lease lapsed before release");
        }
        Ok(held)
    }
}

impl Drop for ContactLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Cancelled mid-decision: hand the lease back in the background, or
        // let it expire when no runtime is around.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let key = std::mem::take(&mut self.key);
            let token = self.token;
            handle.spawn(async move {
                let _ = store.release_lease(&key, token).await;
            });
        }
    }
}

impl std::fmt::Debug for ContactLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactLockGuard")
            .field("contact", &self.contact)
            .field("token", &self.token)
            .finish()
    }
}

/// Shared reference to a lock manager
pub type SharedLockManager = Arc<ContactLockManager>;

/// Per-contact mutex over lease records
pub struct ContactLockManager {
    store: SharedEphemeralStore,
    clock: SharedClock,
    config: LockConfig,
    contention: DashMap<ContactId, VecDeque<DateTime<Utc>>>,
}

impl ContactLockManager {
    pub fn new(store: SharedEphemeralStore, clock: SharedClock, config: LockConfig) -> Self {
        Self {
            store,
            clock,
            config,
            contention: DashMap::new(),
        }
    }

    fn key(contact: &ContactId) -> String {
        format!("lock:contact:{}", contact)
    }

    /// Try to take the contact lock within the acquisition timeout
    pub async fn acquire(&self, contact: &ContactId) -> StoreResult<LockAcquisition> {
        let key = Self::key(contact);
        let token = Uuid::new_v4();
        let timeout = self.config.acquire_timeout();
        let started = tokio::time::Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            let acquired = bounded(
                remaining.max(INITIAL_BACKOFF),
                self.store
                    .acquire_lease(&key, token, self.clock.now(), self.config.lease_ttl()),
            )
            .await?;
            if acquired {
                debug!(contact = %contact, "Contact lock acquired");
                return Ok(LockAcquisition::Acquired(ContactLockGuard {
                    contact: contact.clone(),
                    key,
                    token,
                    store: self.store.clone(),
                    released: false,
                }));
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                let recent = self.note_contention(contact);
                return Ok(LockAcquisition::Contended { recent });
            }
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn note_contention(&self, contact: &ContactId) -> u32 {
        let now = self.clock.now();
        let cutoff = now - self.config.contention_window();
        let mut window = self.contention.entry(contact.clone()).or_default();
        while window.front().is_some_and(|t| *t <= cutoff) {
            window.pop_front();
        }
        window.push_back(now);
        let recent = window.len() as u32;

        if recent >= self.config.contention_warn_threshold {
            warn!(
                contact = %contact,
                recent,
                window_secs = self.config.contention_window_secs,
                "Repeated lock contention; possible race between agents"
            );
        } else {
            debug!(contact = %contact, recent, "Contact lock contended");
        }
        recent
    }

    /// Contentions on `contact` inside the contention window
    pub fn contention_count(&self, contact: &ContactId) -> u32 {
        let cutoff = self.clock.now() - self.config.contention_window();
        self.contention
            .get(contact)
            .map(|w| w.iter().filter(|t| **t > cutoff).count() as u32)
            .unwrap_or(0)
    }

    /// Drop lapsed leases and contention windows with nothing left inside.
    ///
    /// The lease store may also hold rate windows; those keep `retain`.
    pub async fn purge(&self, now: DateTime<Utc>, retain: chrono::Duration) -> usize {
        let cutoff = now - self.config.contention_window();
        let before = self.contention.len();
        self.contention.retain(|_, window| {
            while window.front().is_some_and(|t| *t <= cutoff) {
                window.pop_front();
            }
            !window.is_empty()
        });
        let windows = before - self.contention.len();

        let purged = bounded(self.config.acquire_timeout(), self.store.purge(now, retain)).await;
        let leases = match purged {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Lock lease purge failed");
                0
            }
        };
        windows + leases
    }

    /// Contacts with a live contention window
    pub fn tracked_contacts(&self) -> usize {
        self.contention.len()
    }

    /// Whether `recent` contentions warrant the race warning
    pub fn is_repeated(&self, recent: u32) -> bool {
        recent >= self.config.contention_warn_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Clock;
    use crate::state::{InMemoryEphemeralStore, ManualClock};
    use chrono::Duration;

    fn manager(clock: &ManualClock) -> ContactLockManager {
        ContactLockManager::new(
            InMemoryEphemeralStore::new().shared(),
            Arc::new(clock.clone()),
            LockConfig {
                acquire_timeout_ms: 20,
                ..LockConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_exclusive_then_released() {
        let clock = ManualClock::new(Utc::now());
        let locks = manager(&clock);
        let c = ContactId::new("c1");

        let LockAcquisition::Acquired(guard) = locks.acquire(&c).await.unwrap() else {
            panic!("first acquire should succeed");
        };
        assert!(matches!(
            locks.acquire(&c).await.unwrap(),
            LockAcquisition::Contended { recent: 1 }
        ));
        // Other contacts are independent
        assert!(matches!(
            locks.acquire(&ContactId::new("c2")).await.unwrap(),
            LockAcquisition::Acquired(_)
        ));

        assert!(guard.release().await.unwrap());
        assert!(matches!(
            locks.acquire(&c).await.unwrap(),
            LockAcquisition::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_lease_expiry_frees_crashed_holder() {
        let clock = ManualClock::new(Utc::now());
        let locks = manager(&clock);
        let c = ContactId::new("c1");

        let LockAcquisition::Acquired(stale) = locks.acquire(&c).await.unwrap() else {
            panic!("first acquire should succeed");
        };
        clock.advance(Duration::seconds(6));
        let LockAcquisition::Acquired(fresh) = locks.acquire(&c).await.unwrap() else {
            panic!("expired lease should be taken over");
        };
        // The stale holder cannot release the new lease
        assert!(!stale.release().await.unwrap());
        assert!(fresh.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_acquires_once_holder_releases() {
        let clock = ManualClock::new(Utc::now());
        let locks = Arc::new(ContactLockManager::new(
            InMemoryEphemeralStore::new().shared(),
            Arc::new(clock.clone()),
            LockConfig::default(),
        ));
        let c = ContactId::new("c1");

        let LockAcquisition::Acquired(guard) = locks.acquire(&c).await.unwrap() else {
            panic!("first acquire should succeed");
        };
        let waiter = {
            let locks = locks.clone();
            let c = c.clone();
            tokio::spawn(async move { locks.acquire(&c).await })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        guard.release().await.unwrap();
        assert!(matches!(
            waiter.await.unwrap().unwrap(),
            LockAcquisition::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_repeated_contention_counted_in_window() {
        let clock = ManualClock::new(Utc::now());
        let locks = manager(&clock);
        let c = ContactId::new("c1");
        let _held = locks.acquire(&c).await.unwrap();

        for expected in 1..=3 {
            match locks.acquire(&c).await.unwrap() {
                LockAcquisition::Contended { recent } => assert_eq!(recent, expected),
                LockAcquisition::Acquired(_) => panic!("lock should be held"),
            }
        }
        assert!(locks.is_repeated(3));
        clock.advance(Duration::seconds(61));
        assert_eq!(locks.contention_count(&c), 0);
    }

    #[tokio::test]
    async fn test_purge_drops_quiet_contention_and_lapsed_leases() {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(InMemoryEphemeralStore::new());
        let locks = ContactLockManager::new(
            store.clone(),
            Arc::new(clock.clone()),
            LockConfig {
                acquire_timeout_ms: 20,
                ..LockConfig::default()
            },
        );
        let mut held = Vec::new();
        for id in ["a", "b"] {
            let c = ContactId::new(id);
            let LockAcquisition::Acquired(guard) = locks.acquire(&c).await.unwrap() else {
                panic!("first acquire should succeed");
            };
            assert!(matches!(
                locks.acquire(&c).await.unwrap(),
                LockAcquisition::Contended { .. }
            ));
            held.push(guard);
        }
        assert_eq!(locks.tracked_contacts(), 2);
        assert_eq!(store.key_count(), 2);

        // Nothing has aged out yet
        assert_eq!(locks.purge(clock.now(), Duration::days(1)).await, 0);

        clock.advance(Duration::seconds(61));
        assert_eq!(locks.purge(clock.now(), Duration::days(1)).await, 4);
        assert_eq!(locks.tracked_contacts(), 0);
        assert_eq!(store.key_count(), 0);
        for guard in held {
            assert!(!guard.release().await.unwrap());
        }
    }
}
