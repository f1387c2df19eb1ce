//! Handoff property tests: deterministic sweeps over agents, timings and
//! configs checking the coordinator's safety invariants.
//!
//! Tests verify:
//! - At most one owner per contact under concurrent evaluation
//! - A reversal inside the cooldown is always circular
//! - Executed transitions never exceed max_depth between terminal states,
//!   even when the handoffs come back to back and spend the hourly cap
//! - Executed transitions never exceed the hourly or daily cap
//! - Learned thresholds stay in the clamp and hold until min_samples
//! - Learning moves each route from its own threshold, with no jump when
//!   precision is on target
//! - Stale candidates are rejected regardless of confidence
//! - Backend failures fail closed without moving ownership

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use handoff_coordination::config::{LearnerConfig, RoutingConfig};
use handoff_coordination::state::{SharedContactStore, StoreError, StoreResult, WindowLimit};
use handoff_coordination::{
    AgentKind, Clock, Contact, ContactId, ContactStore, Decision, EphemeralStore, HandoffCandidate,
    HandoffConfig, HandoffCoordinator, HandoffFeedback, InMemoryContactStore,
    InMemoryEphemeralStore, ManualClock, PatternLearner, RejectionReason, TransitionOutcome,
    TransitionRecord,
};
use uuid::Uuid;

const AUTOMATED: [AgentKind; 3] = [AgentKind::Lead, AgentKind::Buyer, AgentKind::Seller];

/// Ephemeral store whose every call fails
struct DownStore;

#[async_trait]
impl EphemeralStore for DownStore {
    async fn window_counts(&self, _: &str, _: DateTime<Utc>, _: &[Duration]) -> StoreResult<Vec<u32>> {
        Err(StoreError::Unavailable("counter backend down".into()))
    }

    async fn record_if_within(
        &self,
        _: &str,
        _: DateTime<Utc>,
        _: Duration,
        _: &[WindowLimit],
    ) -> StoreResult<Option<usize>> {
        Err(StoreError::Unavailable("counter backend down".into()))
    }

    async fn acquire_lease(&self, _: &str, _: Uuid, _: DateTime<Utc>, _: Duration) -> StoreResult<bool> {
        Err(StoreError::Unavailable("lock backend down".into()))
    }

    async fn release_lease(&self, _: &str, _: Uuid) -> StoreResult<bool> {
        Err(StoreError::Unavailable("lock backend down".into()))
    }
}

struct Rig {
    coordinator: Arc<HandoffCoordinator>,
    clock: ManualClock,
    store: SharedContactStore,
}

fn rig(config: HandoffConfig) -> Rig {
    let clock = ManualClock::new(Utc::now());
    let store = InMemoryContactStore::new().shared();
    let coordinator = HandoffCoordinator::builder(config)
        .contact_store(store.clone())
        .ephemeral_store(InMemoryEphemeralStore::new().shared())
        .clock(Arc::new(clock.clone()))
        .build()
        .expect("valid config");
    Rig {
        coordinator: Arc::new(coordinator),
        clock,
        store,
    }
}

async fn seed(r: &Rig, contact: &str, agent: AgentKind) {
    r.store
        .put_contact(&Contact::new(ContactId::new(contact), agent, r.clock.now()))
        .await
        .unwrap();
}

fn next_agent(current: AgentKind, step: usize) -> AgentKind {
    let others: Vec<_> = AUTOMATED.iter().copied().filter(|a| *a != current).collect();
    others[step % others.len()]
}

async fn executed(r: &Rig, contact: &str) -> Vec<TransitionRecord> {
    r.store
        .transitions_for(&ContactId::new(contact))
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.outcome == TransitionOutcome::Executed)
        .collect()
}

// ── Property: single ownership ─────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn prop_single_owner_under_concurrent_candidates() {
    for fanout in [2usize, 3, 6] {
        let r = rig(HandoffConfig::default());
        let contact = format!("fan-{}", fanout);
        seed(&r, &contact, AgentKind::Lead).await;

        let mut handles = Vec::new();
        for i in 0..fanout {
            let target = if i % 2 == 0 { AgentKind::Buyer } else { AgentKind::Seller };
            let cand = HandoffCandidate::new(contact.as_str(), AgentKind::Lead, target, 0.9, "intent", r.clock.now());
            let c = r.coordinator.clone();
            handles.push(tokio::spawn(async move { c.evaluate(cand).await }));
        }
        let decisions: Vec<Decision> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|d| d.unwrap())
            .collect();

        let winners: Vec<_> = decisions.iter().filter(|d| d.is_allowed()).collect();
        assert_eq!(winners.len(), 1, "fanout={}: {:?}", fanout, decisions);
        assert_eq!(executed(&r, &contact).await.len(), 1, "fanout={}", fanout);

        let owner = r.coordinator.contact_status(&contact.as_str().into()).await.unwrap().active_agent;
        match winners[0] {
            Decision::Allowed { package, .. } => assert_eq!(package.target_agent, owner),
            _ => unreachable!(),
        }
    }
}

// ── Property: no immediate ping-pong ───────────────────────────────

#[tokio::test]
async fn prop_reversal_within_cooldown_is_circular() {
    for a in AUTOMATED {
        for b in AUTOMATED.into_iter().filter(|b| *b != a) {
            for gap_minutes in [0i64, 1, 15, 29] {
                let r = rig(HandoffConfig::default());
                let contact = format!("{}-{}-{}", a, b, gap_minutes);
                seed(&r, &contact, a).await;

                let forward = HandoffCandidate::new(contact.as_str(), a, b, 0.9, "intent", r.clock.now());
                assert!(r.coordinator.evaluate(forward).await.is_allowed());

                r.clock.advance(Duration::minutes(gap_minutes));
                let back = HandoffCandidate::new(contact.as_str(), b, a, 0.99, "intent", r.clock.now());
                let decision = r.coordinator.evaluate(back).await;
                assert_eq!(
                    decision.rejection().map(|x| x.code()),
                    Some("circular"),
                    "{}->{} reversed after {}m: {:?}",
                    a,
                    b,
                    gap_minutes,
                    decision
                );
            }
        }
    }
}

// ── Property: depth bound ──────────────────────────────────────────

#[tokio::test]
async fn prop_depth_never_exceeds_max() {
    for max_depth in [1u32, 2, 3, 4] {
        let mut config = HandoffConfig::default();
        config.circular.max_depth = max_depth;
        let r = rig(config);
        let contact = format!("depth-{}", max_depth);
        seed(&r, &contact, AgentKind::Lead).await;

        let mut current = AgentKind::Lead;
        for step in 0..(max_depth as usize + 1) {
            let target = next_agent(current, step);
            let cand = HandoffCandidate::new(contact.as_str(), current, target, 0.95, "intent", r.clock.now());
            let decision = r.coordinator.evaluate(cand).await;

            if step < max_depth as usize {
                assert!(decision.is_allowed(), "max_depth={} step={}: {:?}", max_depth, step, decision);
                current = target;
            } else {
                assert_eq!(
                    decision.rejection(),
                    Some(&RejectionReason::DepthExceeded { depth: max_depth }),
                    "max_depth={}",
                    max_depth
                );
                assert_eq!(decision.record().map(|x| x.outcome), Some(TransitionOutcome::BlockedDepth));
            }
            // Past the cooldown, inside the hourly cap.
            r.clock.advance(Duration::minutes(31));
        }

        assert_eq!(executed(&r, &contact).await.len(), max_depth as usize);
        let status = r.coordinator.contact_status(&contact.as_str().into()).await.unwrap();
        assert!(status.escalated, "max_depth={}", max_depth);
    }
}

#[tokio::test]
async fn prop_depth_escalates_back_to_back_under_default_caps() {
    let hourly_cap = HandoffConfig::default().rate_limit.hourly_cap;
    for max_depth in 1..=hourly_cap {
        for gap_minutes in [0i64, 1, 5] {
            let mut config = HandoffConfig::default();
            config.circular.max_depth = max_depth;
            let r = rig(config);
            let contact = format!("burst-{}-{}", max_depth, gap_minutes);
            seed(&r, &contact, AgentKind::Lead).await;

            let mut current = AgentKind::Lead;
            for step in 0..max_depth as usize {
                let target = next_agent(current, step);
                let cand = HandoffCandidate::new(contact.as_str(), current, target, 0.95, "intent", r.clock.now());
                let decision = r.coordinator.evaluate(cand).await;
                assert!(decision.is_allowed(), "max_depth={} step={}: {:?}", max_depth, step, decision);
                current = target;
                r.clock.advance(Duration::minutes(gap_minutes));
            }

            let target = next_agent(current, max_depth as usize);
            let cand = HandoffCandidate::new(contact.as_str(), current, target, 1.0, "intent", r.clock.now());
            let decision = r.coordinator.evaluate(cand).await;
            assert_eq!(
                decision.rejection(),
                Some(&RejectionReason::DepthExceeded { depth: max_depth }),
                "max_depth={} gap={}m",
                max_depth,
                gap_minutes
            );
            assert_eq!(decision.record().map(|x| x.outcome), Some(TransitionOutcome::BlockedDepth));

            let status = r.coordinator.contact_status(&contact.as_str().into()).await.unwrap();
            assert!(status.escalated, "max_depth={} gap={}m", max_depth, gap_minutes);
            assert_eq!(executed(&r, &contact).await.len(), max_depth as usize);
        }
    }
}

// ── Property: rate bound ───────────────────────────────────────────

#[tokio::test]
async fn prop_rolling_windows_never_exceed_caps() {
    for (hourly, daily, spacing_minutes) in [(1u32, 3u32, 10i64), (2, 5, 7), (3, 10, 5), (3, 4, 20)] {
        let mut config = HandoffConfig::default();
        config.rate_limit.hourly_cap = hourly;
        config.rate_limit.daily_cap = daily;
        config.circular.cooldown_secs = 1;
        config.circular.max_depth = 1000;
        let r = rig(config);
        let contact = format!("rate-{}-{}", hourly, daily);
        seed(&r, &contact, AgentKind::Lead).await;

        let mut current = AgentKind::Lead;
        for step in 0..60 {
            let target = next_agent(current, step);
            let cand = HandoffCandidate::new(contact.as_str(), current, target, 0.95, "intent", r.clock.now());
            if r.coordinator.evaluate(cand).await.is_allowed() {
                current = target;
            }

            let now = r.clock.now();
            let done = executed(&r, &contact).await;
            let in_hour = done.iter().filter(|t| t.decided_at > now - Duration::hours(1)).count();
            let in_day = done.iter().filter(|t| t.decided_at > now - Duration::days(1)).count();
            assert!(in_hour <= hourly as usize, "hourly={} step={}: {}", hourly, step, in_hour);
            assert!(in_day <= daily as usize, "daily={} step={}: {}", daily, step, in_day);

            r.clock.advance(Duration::minutes(spacing_minutes));
        }
        assert!(!executed(&r, &contact).await.is_empty());
    }
}

// ── Property: threshold clamp and min samples ──────────────────────

#[test]
fn prop_learned_threshold_clamped_and_gated() {
    for (success_every, min_samples) in [(1usize, 10u64), (2, 10), (5, 3), (usize::MAX, 5)] {
        let clock = ManualClock::new(Utc::now());
        let learner_config = LearnerConfig {
            min_samples,
            ..LearnerConfig::default()
        };
        let routing = RoutingConfig::default();
        let route_default = routing.route_threshold(AgentKind::Lead, AgentKind::Buyer);
        let learner = PatternLearner::new(learner_config.clone(), routing, Arc::new(clock.clone()));

        for i in 0..40u64 {
            let cand = HandoffCandidate::new("c", AgentKind::Lead, AgentKind::Buyer, 0.9, "budget_mention", clock.now());
            let record = TransitionRecord::for_candidate(&cand, TransitionOutcome::Executed, clock.now());
            assert!(learner.observe(&record));
            let feedback = if success_every != usize::MAX && (i as usize) % success_every == 0 {
                HandoffFeedback::Progressed
            } else {
                HandoffFeedback::Reverted
            };
            let stat = learner.apply_feedback(record.id, feedback).unwrap();
            assert_eq!(stat.sample_count, i + 1);

            let threshold = learner.effective_threshold(&"budget_mention".into(), AgentKind::Lead, AgentKind::Buyer);
            assert!(
                threshold >= learner_config.threshold_min && threshold <= learner_config.threshold_max,
                "threshold {} escaped clamp",
                threshold
            );
            if stat.sample_count <= min_samples {
                assert_eq!(threshold, route_default, "moved before min_samples at sample {}", i + 1);
            }
        }
    }
}

#[test]
fn prop_learning_starts_from_each_route_threshold() {
    let routes = [
        (AgentKind::Seller, AgentKind::Buyer),
        (AgentKind::Buyer, AgentKind::Seller),
        (AgentKind::Lead, AgentKind::Buyer),
    ];
    for (source, target) in routes {
        for (success_every, min_samples) in [(1usize, 10u64), (2, 10), (5, 4), (10, 9)] {
            let clock = ManualClock::new(Utc::now());
            let learner_config = LearnerConfig {
                min_samples,
                ..LearnerConfig::default()
            };
            let routing = RoutingConfig::default();
            let route_default = routing.route_threshold(source, target);
            let learner = PatternLearner::new(learner_config.clone(), routing, Arc::new(clock.clone()));
            let signal = "budget_mention".into();

            for i in 0..30u64 {
                let cand = HandoffCandidate::new("c", source, target, 0.9, "budget_mention", clock.now());
                let record = TransitionRecord::for_candidate(&cand, TransitionOutcome::Executed, clock.now());
                learner.observe(&record);
                // Every `success_every`-th sample fails, the rest progress
                let feedback = if (i as usize + 1) % success_every == 0 {
                    HandoffFeedback::Reverted
                } else {
                    HandoffFeedback::Progressed
                };
                let stat = learner.apply_feedback(record.id, feedback).unwrap();
                let threshold = learner.effective_threshold(&signal, source, target);

                if stat.sample_count <= min_samples {
                    assert_eq!(threshold, route_default, "{}->{} moved early", source, target);
                    continue;
                }
                let rate = stat.success_rate().unwrap();
                let expected = learner_config.clamp(
                    route_default + (learner_config.target_precision - rate) * learner_config.gain,
                );
                assert!(
                    (threshold - expected).abs() < 1e-9,
                    "{}->{} sample {}: {} != {}",
                    source,
                    target,
                    stat.sample_count,
                    threshold,
                    expected
                );
                if rate >= learner_config.target_precision {
                    assert!(threshold <= route_default + 1e-9, "{}->{} tightened at rate {}", source, target, rate);
                } else {
                    assert!(threshold >= route_default - 1e-9, "{}->{} loosened at rate {}", source, target, rate);
                }
            }
        }
    }
}

#[test]
fn prop_on_target_precision_keeps_route_threshold_at_activation() {
    for (source, target) in [
        (AgentKind::Seller, AgentKind::Buyer),
        (AgentKind::Buyer, AgentKind::Seller),
        (AgentKind::Lead, AgentKind::Seller),
    ] {
        // 4 of 5 progressed is exactly the 0.8 target once min_samples (4) is passed
        let clock = ManualClock::new(Utc::now());
        let routing = RoutingConfig::default();
        let route_default = routing.route_threshold(source, target);
        let learner = PatternLearner::new(
            LearnerConfig {
                min_samples: 4,
                ..LearnerConfig::default()
            },
            routing,
            Arc::new(clock.clone()),
        );

        let mut seen = Vec::new();
        for i in 0..5 {
            let cand = HandoffCandidate::new("c", source, target, 0.9, "listing_intent", clock.now());
            let record = TransitionRecord::for_candidate(&cand, TransitionOutcome::Executed, clock.now());
            learner.observe(&record);
            let feedback = if i == 2 { HandoffFeedback::Stalled } else { HandoffFeedback::Progressed };
            learner.apply_feedback(record.id, feedback).unwrap();
            seen.push(learner.effective_threshold(&"listing_intent".into(), source, target));
        }
        assert!(
            seen.iter().all(|t| (t - route_default).abs() < 1e-9),
            "{}->{}: {:?}",
            source,
            target,
            seen
        );
    }
}

// ── Property: stale rejection ──────────────────────────────────────

#[tokio::test]
async fn prop_stale_source_rejected_at_any_confidence() {
    for owner in AUTOMATED {
        for source in AUTOMATED.into_iter().filter(|s| *s != owner) {
            for confidence in [0.0, 0.3, 0.7, 1.0] {
                let r = rig(HandoffConfig::default());
                seed(&r, "stale", owner).await;
                let target = next_agent(source, 0);
                let cand = HandoffCandidate::new("stale", source, target, confidence, "intent", r.clock.now());
                let decision = r.coordinator.evaluate(cand).await;
                assert_eq!(
                    decision.rejection(),
                    Some(&RejectionReason::StaleSource { current: owner }),
                    "owner={} source={} conf={}",
                    owner,
                    source,
                    confidence
                );
                assert!(r.store.transitions_for(&"stale".into()).await.unwrap().is_empty());
            }
        }
    }
}

// ── Property: backend failure fails closed ─────────────────────────

#[tokio::test]
async fn prop_lock_backend_down_never_moves_ownership() {
    for target in [AgentKind::Buyer, AgentKind::Seller, AgentKind::Human] {
        let clock = ManualClock::new(Utc::now());
        let store = InMemoryContactStore::new().shared();
        let coordinator = HandoffCoordinator::builder(HandoffConfig::default())
            .contact_store(store.clone())
            .rate_store(InMemoryEphemeralStore::new().shared())
            .lock_store(Arc::new(DownStore))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        let cand = HandoffCandidate::new("c", AgentKind::Lead, target, 0.95, "intent", clock.now());
        let decision = coordinator.evaluate(cand).await;
        assert_eq!(decision.rejection().map(|x| x.code()), Some("backend_unavailable"), "{:?}", decision);

        let status = coordinator.contact_status(&"c".into()).await.unwrap();
        assert_eq!(status.active_agent, AgentKind::Lead);
        assert!(!status.escalated);
    }
}

#[tokio::test]
async fn prop_rate_backend_down_allows_only_burst() {
    for burst in [1u32, 2, 3] {
        let mut config = HandoffConfig::default();
        config.rate_limit.degraded_burst = burst;
        config.circular.cooldown_secs = 1;
        let clock = ManualClock::new(Utc::now());
        let store = InMemoryContactStore::new().shared();
        let coordinator = HandoffCoordinator::builder(config)
            .contact_store(store.clone())
            .rate_store(Arc::new(DownStore))
            .lock_store(InMemoryEphemeralStore::new().shared())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        let mut current = AgentKind::Lead;
        let mut allowed = 0;
        for step in 0..6 {
            let target = next_agent(current, step);
            let cand = HandoffCandidate::new("c", current, target, 0.95, "intent", clock.now());
            match coordinator.evaluate(cand).await {
                Decision::Allowed { .. } => {
                    allowed += 1;
                    current = target;
                }
                Decision::Rejected {
                    reason: RejectionReason::BackendUnavailable { .. },
                    record,
                } => {
                    assert_eq!(record.map(|x| x.outcome), Some(TransitionOutcome::BlockedRateLimit));
                }
                Decision::Rejected {
                    reason: RejectionReason::DepthExceeded { .. },
                    ..
                } => break,
                other => panic!("burst={} step={}: unexpected {:?}", burst, step, other),
            }
            clock.advance(Duration::seconds(5));
        }
        assert_eq!(allowed, burst.min(3) as usize, "burst={}", burst);
    }
}
