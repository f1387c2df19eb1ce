//! Per-contact and per-route handoff caps
//!
//! Counters live in the [`EphemeralStore`] as sliding windows of executed
//! handoff timestamps. [`RateLimiter::check`] is a read-only pre-screen run
//! before the contact lock; [`RateLimiter::try_record`] is the atomic
//! check-and-append run while the lock is held.
//!
//! When the backend is unreachable the limiter falls back to an in-process
//! per-contact window that admits at most `degraded_burst` handoffs per hour
//! and fails closed above it.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::state::{
    bounded, AgentKind, ContactId, EphemeralStore, InMemoryEphemeralStore, SharedEphemeralStore,
    WindowLimit,
};

/// Which cap stopped a handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateWindow {
    ContactHourly,
    ContactDaily,
    RouteHourly,
}

impl std::fmt::Display for RateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateWindow::ContactHourly => write!(f, "contact_hourly"),
            RateWindow::ContactDaily => write!(f, "contact_daily"),
            RateWindow::RouteHourly => write!(f, "route_hourly"),
        }
    }
}

/// Result of a rate check
#[derive(Debug, Clone, PartialEq)]
pub enum RateVerdict {
    /// Below every cap
    Within,
    /// A cap is reached
    Exceeded(RateWindow),
    /// Counters unreachable; local burst allowance still open
    DegradedWithin { cause: String },
    /// Counters unreachable and local burst allowance spent
    Unavailable { cause: String },
}

impl RateVerdict {
    /// Whether the handoff may proceed
    pub fn permits(&self) -> bool {
        matches!(self, RateVerdict::Within | RateVerdict::DegradedWithin { .. })
    }
}

/// Sliding-window handoff caps
pub struct RateLimiter {
    store: SharedEphemeralStore,
    fallback: InMemoryEphemeralStore,
    config: RateLimitConfig,
    call_timeout: StdDuration,
}

impl RateLimiter {
    pub fn new(store: SharedEphemeralStore, config: RateLimitConfig, call_timeout: StdDuration) -> Self {
        Self {
            store,
            fallback: InMemoryEphemeralStore::new(),
            config,
            call_timeout,
        }
    }

    fn contact_key(contact: &ContactId) -> String {
        format!("rate:contact:{}", contact)
    }

    fn route_key(source: AgentKind, target: AgentKind) -> String {
        format!("rate:route:{}->{}", source, target)
    }

    fn contact_limits(&self) -> [WindowLimit; 2] {
        [
            WindowLimit {
                window: Duration::hours(1),
                cap: self.config.hourly_cap,
            },
            WindowLimit {
                window: Duration::days(1),
                cap: self.config.daily_cap,
            },
        ]
    }

    fn route_limit(&self) -> [WindowLimit; 1] {
        [WindowLimit {
            window: Duration::hours(1),
            cap: self.config.route_hourly_cap,
        }]
    }

    fn burst_limit(&self) -> [WindowLimit; 1] {
        [WindowLimit {
            window: Duration::hours(1),
            cap: self.config.degraded_burst,
        }]
    }

    /// Read-only pre-screen; consumes nothing
    pub async fn check(
        &self,
        contact: &ContactId,
        source: AgentKind,
        target: AgentKind,
        now: DateTime<Utc>,
    ) -> RateVerdict {
        let windows = [Duration::hours(1), Duration::days(1)];
        let counts = bounded(
            self.call_timeout,
            self.store
                .window_counts(&Self::contact_key(contact), now, &windows),
        )
        .await;
        let route = bounded(
            self.call_timeout,
            self.store.window_counts(
                &Self::route_key(source, target),
                now,
                &[Duration::hours(1)],
            ),
        )
        .await;

        match (counts, route) {
            (Ok(c), Ok(r)) => {
                let hourly = c.first().copied().unwrap_or(0);
                let daily = c.get(1).copied().unwrap_or(0);
                let route = r.first().copied().unwrap_or(0);
                if hourly >= self.config.hourly_cap {
                    RateVerdict::Exceeded(RateWindow::ContactHourly)
                } else if daily >= self.config.daily_cap {
                    RateVerdict::Exceeded(RateWindow::ContactDaily)
                } else if route >= self.config.route_hourly_cap {
                    RateVerdict::Exceeded(RateWindow::RouteHourly)
                } else {
                    RateVerdict::Within
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                let spent = self
                    .fallback
                    .window_counts(&Self::contact_key(contact), now, &[Duration::hours(1)])
                    .await
                    .ok()
                    .and_then(|c| c.first().copied())
                    .unwrap_or(u32::MAX);
                self.degraded(contact, spent < self.config.degraded_burst, e.to_string())
            }
        }
    }

    /// Atomically re-check every cap and count one executed handoff
    pub async fn try_record(
        &self,
        contact: &ContactId,
        source: AgentKind,
        target: AgentKind,
        now: DateTime<Utc>,
    ) -> RateVerdict {
        let contact_key = Self::contact_key(contact);
        let contact_result = bounded(
            self.call_timeout,
            self.store
                .record_if_within(&contact_key, now, Duration::days(1), &self.contact_limits()),
        )
        .await;

        match contact_result {
            Ok(Some(0)) => return RateVerdict::Exceeded(RateWindow::ContactHourly),
            Ok(Some(_)) => return RateVerdict::Exceeded(RateWindow::ContactDaily),
            Ok(None) => {}
            Err(e) => return self.record_degraded(contact, now, e.to_string()).await,
        }

        // A route block after the contact append leaves the contact counted;
        // that only ever errs toward fewer handoffs.
        let route_result = bounded(
            self.call_timeout,
            self.store.record_if_within(
                &Self::route_key(source, target),
                now,
                Duration::hours(1),
                &self.route_limit(),
            ),
        )
        .await;

        match route_result {
            Ok(None) => RateVerdict::Within,
            Ok(Some(_)) => RateVerdict::Exceeded(RateWindow::RouteHourly),
            Err(e) => {
                warn!(
                    route = %Self::route_key(source, target),
                    error = %e,
                    "Route counter unavailable after contact counter accepted"
                );
                RateVerdict::DegradedWithin {
                    cause: e.to_string(),
                }
            }
        }
    }

    async fn record_degraded(&self, contact: &ContactId, now: DateTime<Utc>, cause: String) -> RateVerdict {
        let admitted = matches!(
            self.fallback
                .record_if_within(
                    &Self::contact_key(contact),
                    now,
                    Duration::hours(1),
                    &self.burst_limit(),
                )
                .await,
            Ok(None)
        );
        self.degraded(contact, admitted, cause)
    }

    /// Longest window any counter needs
    pub fn retention() -> Duration {
        Duration::days(1)
    }

    /// Drop counters with nothing inside the daily window, in the backend and
    /// in the degraded-mode fallback
    pub async fn purge(&self, now: DateTime<Utc>) -> usize {
        let local = self
            .fallback
            .purge(now, Self::retention())
            .await
            .unwrap_or_default();
        let purged = bounded(self.call_timeout, self.store.purge(now, Self::retention())).await;
        let remote = match purged {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Rate counter purge failed");
                0
            }
        };
        local + remote
    }

    /// Keys held by the degraded-mode fallback
    pub fn fallback_keys(&self) -> usize {
        self.fallback.key_count()
    }

    fn degraded(&self, contact: &ContactId, admitted: bool, cause: String) -> RateVerdict {
        warn!(
            contact = %contact,
            burst = self.config.degraded_burst,
            admitted,
            error = %cause,
            "Rate counters unavailable; running in degraded mode"
        );
        if admitted {
            RateVerdict::DegradedWithin { cause }
        } else {
            debug!(contact = %contact, "Degraded burst spent; failing closed");
            RateVerdict::Unavailable { cause }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StoreError, StoreResult};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct DownStore;

    #[async_trait]
    impl EphemeralStore for DownStore {
        async fn window_counts(&self, _: &str, _: DateTime<Utc>, _: &[Duration]) -> StoreResult<Vec<u32>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn record_if_within(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: Duration,
            _: &[WindowLimit],
        ) -> StoreResult<Option<usize>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn acquire_lease(&self, _: &str, _: Uuid, _: DateTime<Utc>, _: Duration) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn release_lease(&self, _: &str, _: Uuid) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    fn limiter(store: SharedEphemeralStore) -> RateLimiter {
        RateLimiter::new(store, RateLimitConfig::default(), StdDuration::from_millis(50))
    }

    #[tokio::test]
    async fn test_hourly_cap_then_window_slides() {
        let rl = limiter(InMemoryEphemeralStore::new().shared());
        let c = ContactId::new("c1");
        let t0 = Utc::now();

        for i in 0..3 {
            let at = t0 + Duration::minutes(i);
            assert_eq!(rl.try_record(&c, AgentKind::Lead, AgentKind::Buyer, at).await, RateVerdict::Within);
        }
        let at = t0 + Duration::minutes(10);
        assert_eq!(
            rl.check(&c, AgentKind::Buyer, AgentKind::Seller, at).await,
            RateVerdict::Exceeded(RateWindow::ContactHourly)
        );
        assert_eq!(
            rl.try_record(&c, AgentKind::Buyer, AgentKind::Seller, at).await,
            RateVerdict::Exceeded(RateWindow::ContactHourly)
        );

        let later = t0 + Duration::minutes(61);
        assert_eq!(rl.check(&c, AgentKind::Buyer, AgentKind::Seller, later).await, RateVerdict::Within);
    }

    #[tokio::test]
    async fn test_daily_cap() {
        let rl = limiter(InMemoryEphemeralStore::new().shared());
        let c = ContactId::new("c1");
        let t0 = Utc::now();

        for i in 0..10 {
            let at = t0 + Duration::hours(2 * i);
            assert!(rl.try_record(&c, AgentKind::Lead, AgentKind::Buyer, at).await.permits());
        }
        let at = t0 + Duration::hours(20) + Duration::minutes(30);
        assert_eq!(
            rl.try_record(&c, AgentKind::Lead, AgentKind::Buyer, at).await,
            RateVerdict::Exceeded(RateWindow::ContactDaily)
        );
    }

    #[tokio::test]
    async fn test_route_cap_spans_contacts() {
        let config = RateLimitConfig {
            route_hourly_cap: 2,
            ..RateLimitConfig::default()
        };
        let rl = RateLimiter::new(
            InMemoryEphemeralStore::new().shared(),
            config,
            StdDuration::from_millis(50),
        );
        let t0 = Utc::now();
        for id in ["a", "b"] {
            assert_eq!(
                rl.try_record(&ContactId::new(id), AgentKind::Lead, AgentKind::Buyer, t0).await,
                RateVerdict::Within
            );
        }
        assert_eq!(
            rl.check(&ContactId::new("c"), AgentKind::Lead, AgentKind::Buyer, t0).await,
            RateVerdict::Exceeded(RateWindow::RouteHourly)
        );
        // Other routes unaffected
        assert_eq!(
            rl.check(&ContactId::new("c"), AgentKind::Lead, AgentKind::Seller, t0).await,
            RateVerdict::Within
        );
    }

    #[tokio::test]
    async fn test_check_consumes_nothing() {
        let rl = limiter(InMemoryEphemeralStore::new().shared());
        let c = ContactId::new("c1");
        let t0 = Utc::now();
        for _ in 0..10 {
            assert_eq!(rl.check(&c, AgentKind::Lead, AgentKind::Buyer, t0).await, RateVerdict::Within);
        }
    }

    #[tokio::test]
    async fn test_backend_down_allows_burst_then_fails_closed() {
        let rl = limiter(std::sync::Arc::new(DownStore));
        let c = ContactId::new("c1");
        let t0 = Utc::now();

        assert!(matches!(
            rl.check(&c, AgentKind::Lead, AgentKind::Buyer, t0).await,
            RateVerdict::DegradedWithin { .. }
        ));
        assert!(matches!(
            rl.try_record(&c, AgentKind::Lead, AgentKind::Buyer, t0).await,
            RateVerdict::DegradedWithin { .. }
        ));
        assert!(matches!(
            rl.check(&c, AgentKind::Buyer, AgentKind::Seller, t0).await,
            RateVerdict::Unavailable { .. }
        ));
        assert!(!rl
            .try_record(&c, AgentKind::Buyer, AgentKind::Seller, t0)
            .await
            .permits());

        // Burst allowance is per contact
        assert!(rl
            .try_record(&ContactId::new("c2"), AgentKind::Lead, AgentKind::Buyer, t0)
            .await
            .permits());
    }

    #[tokio::test]
    async fn test_purge_drops_counters_past_daily_retention() {
        let store = std::sync::Arc::new(InMemoryEphemeralStore::new());
        let rl = limiter(store.clone());
        let t0 = Utc::now();
        rl.try_record(&ContactId::new("c1"), AgentKind::Lead, AgentKind::Buyer, t0).await;
        rl.try_record(&ContactId::new("c2"), AgentKind::Lead, AgentKind::Seller, t0 + Duration::hours(20))
            .await;
        assert_eq!(store.key_count(), 4);

        // c1 and its route have aged out; c2 still counts toward its day
        assert_eq!(rl.purge(t0 + Duration::hours(25)).await, 2);
        assert_eq!(store.key_count(), 2);
        assert_eq!(
            rl.check(&ContactId::new("c2"), AgentKind::Lead, AgentKind::Seller, t0 + Duration::hours(25))
                .await,
            RateVerdict::Within
        );
        assert_eq!(rl.purge(t0 + Duration::hours(45)).await, 2);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_empties_degraded_fallback() {
        let rl = limiter(std::sync::Arc::new(DownStore));
        let t0 = Utc::now();
        for id in ["a", "b", "c"] {
            rl.try_record(&ContactId::new(id), AgentKind::Lead, AgentKind::Buyer, t0).await;
        }
        assert_eq!(rl.fallback_keys(), 3);
        assert_eq!(rl.purge(t0 + Duration::days(2)).await, 3);
        assert_eq!(rl.fallback_keys(), 0);
    }
}
