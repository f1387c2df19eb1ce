//! Agent Health Registry: rolling latency and error-rate windows per agent
//!
//! Agents report `(latency_ms, success)` samples through a [`HealthReporter`]
//! without waiting on the coordinator. A background ingest task drains the
//! channel into the registry, which keeps a count- and time-bounded window per
//! agent and judges it against that agent's SLA:
//!
//! ```text
//! agent ──try_send──▶ mpsc (bounded) ──ingest task──▶ AgentHealthRegistry
//!                                                        │
//!                        coordinator ──assess(agent)─────┘
//! ```
//!
//! Fewer than `min_samples` fresh samples is [`HealthAssessment::Unknown`],
//! which callers treat as healthy.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::state::{AgentKind, SharedClock};

/// One request observed by an agent's own request path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealthSample {
    pub agent: AgentKind,
    pub latency_ms: u64,
    pub success: bool,
    pub sampled_at: DateTime<Utc>,
}

/// Why an agent is considered degraded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    LatencyOverSla,
    ErrorRateOverCeiling,
}

/// Health verdict for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "health", rename_all = "snake_case")]
pub enum HealthAssessment {
    Healthy {
        p95_ms: u64,
        error_rate: f64,
    },
    Degraded {
        p95_ms: u64,
        error_rate: f64,
        reason: DegradedReason,
    },
    /// Not enough fresh samples to judge
    Unknown { fresh_samples: usize },
}

impl HealthAssessment {
    /// Whether a handoff to this agent may proceed
    pub fn admits_handoff(&self) -> bool {
        !matches!(self, HealthAssessment::Degraded { .. })
    }
}

/// Per-agent summary for status output
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealthSummary {
    pub agent: AgentKind,
    pub sla_ms: Option<u64>,
    pub assessment: HealthAssessment,
}

/// Shared reference to the registry
pub type SharedHealthRegistry = Arc<AgentHealthRegistry>;

/// Rolling health windows per agent
pub struct AgentHealthRegistry {
    samples: DashMap<AgentKind, VecDeque<AgentHealthSample>>,
    config: HealthConfig,
    clock: SharedClock,
}

impl AgentHealthRegistry {
    pub fn new(config: HealthConfig, clock: SharedClock) -> Self {
        Self {
            samples: DashMap::new(),
            config,
            clock,
        }
    }

    /// Create a shared reference to this registry
    pub fn shared(self) -> SharedHealthRegistry {
        Arc::new(self)
    }

    /// Add a sample, evicting beyond the window size
    pub fn record(&self, sample: AgentHealthSample) {
        let mut window = self.samples.entry(sample.agent).or_default();
        window.push_back(sample);
        while window.len() > self.config.max_samples {
            window.pop_front();
        }
    }

    fn fresh(&self, agent: AgentKind, now: DateTime<Utc>) -> Vec<AgentHealthSample> {
        let cutoff = now - self.config.window();
        self.samples
            .get(&agent)
            .map(|w| w.iter().filter(|s| s.sampled_at > cutoff).cloned().collect())
            .unwrap_or_default()
    }

    /// Judge `agent` against its SLA over the freshness window
    pub fn assess(&self, agent: AgentKind) -> HealthAssessment {
        let Some(sla_ms) = self.config.sla.for_agent(agent) else {
            return HealthAssessment::Healthy {
                p95_ms: 0,
                error_rate: 0.0,
            };
        };

        let fresh = self.fresh(agent, self.clock.now());
        if fresh.len() < self.config.min_samples {
            return HealthAssessment::Unknown {
                fresh_samples: fresh.len(),
            };
        }

        let mut latencies: Vec<u64> = fresh.iter().map(|s| s.latency_ms).collect();
        let p95_ms = percentile(&mut latencies, 0.95);
        let failures = fresh.iter().filter(|s| !s.success).count();
        let error_rate = failures as f64 / fresh.len() as f64;

        if p95_ms as f64 > sla_ms as f64 * self.config.sla_tolerance {
            HealthAssessment::Degraded {
                p95_ms,
                error_rate,
                reason: DegradedReason::LatencyOverSla,
            }
        } else if error_rate > self.config.error_rate_ceiling {
            HealthAssessment::Degraded {
                p95_ms,
                error_rate,
                reason: DegradedReason::ErrorRateOverCeiling,
            }
        } else {
            HealthAssessment::Healthy { p95_ms, error_rate }
        }
    }

    pub fn is_healthy(&self, agent: AgentKind) -> bool {
        self.assess(agent).admits_handoff()
    }

    /// Assessment of every agent
    pub fn summary(&self) -> Vec<AgentHealthSummary> {
        AgentKind::all()
            .iter()
            .map(|&agent| AgentHealthSummary {
                agent,
                sla_ms: self.config.sla.for_agent(agent),
                assessment: self.assess(agent),
            })
            .collect()
    }
}

/// Nearest-rank percentile; 0 for an empty slice
fn percentile(values: &mut [u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let rank = (p * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

/// Fire-and-forget sample sender handed to agent processes
#[derive(Clone)]
pub struct HealthReporter {
    tx: mpsc::Sender<AgentHealthSample>,
}

impl HealthReporter {
    /// Queue a sample; returns false if it was dropped
    pub fn report(&self, sample: AgentHealthSample) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(s)) => {
                debug!(agent = %s.agent, "Health channel full; sample dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Health ingest stopped; sample dropped");
                false
            }
        }
    }
}

/// Start the ingest task; the task ends once every reporter is dropped
pub fn spawn_health_ingest(
    registry: SharedHealthRegistry,
    capacity: usize,
) -> (HealthReporter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        let mut ingested: u64 = 0;
        while let Some(sample) = rx.recv().await {
            registry.record(sample);
            ingested += 1;
        }
        info!(ingested, "Health ingest stopped");
    });
    (HealthReporter { tx }, handle)
}
