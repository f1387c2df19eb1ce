//! Handoff configuration
//!
//! Loaded from TOML, then overridden by `HANDOFF_*` environment variables,
//! then validated. Every section defaults independently, so a file only needs
//! the settings it changes:
//!
//! ```toml
//! [rate_limit]
//! hourly_cap = 5
//!
//! [[routing.route_thresholds]]
//! source = "seller"
//! target = "buyer"
//! threshold = 0.65
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HandoffError, HandoffResult};
use crate::state::AgentKind;

/// Top-level handoff configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    pub routing: RoutingConfig,
    pub rate_limit: RateLimitConfig,
    pub circular: CircularConfig,
    pub health: HealthConfig,
    pub lock: LockConfig,
    pub context: ContextConfig,
    pub learner: LearnerConfig,
    pub deadlines: DeadlineConfig,
    pub tags: TagConfig,
}

/// Confidence threshold for one source→target route
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteThreshold {
    pub source: AgentKind,
    pub target: AgentKind,
    pub threshold: f64,
}

/// Ownership defaults and confidence thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Owner assigned to a contact on its first inbound signal
    pub entry_agent: AgentKind,
    /// Threshold for routes without an explicit entry
    pub default_threshold: f64,
    /// Per-route thresholds
    pub route_thresholds: Vec<RouteThreshold>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let route = |source, target, threshold| RouteThreshold {
            source,
            target,
            threshold,
        };
        Self {
            entry_agent: AgentKind::Lead,
            default_threshold: 0.7,
            route_thresholds: vec![
                route(AgentKind::Lead, AgentKind::Buyer, 0.7),
                route(AgentKind::Lead, AgentKind::Seller, 0.7),
                route(AgentKind::Seller, AgentKind::Buyer, 0.6),
                route(AgentKind::Buyer, AgentKind::Seller, 0.6),
            ],
        }
    }
}

impl RoutingConfig {
    /// Vetted threshold for a route before any learning
    pub fn route_threshold(&self, source: AgentKind, target: AgentKind) -> f64 {
        self.route_thresholds
            .iter()
            .find(|r| r.source == source && r.target == target)
            .map(|r| r.threshold)
            .unwrap_or(self.default_threshold)
    }
}

/// Handoff caps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Executed handoffs per contact per rolling hour
    pub hourly_cap: u32,
    /// Executed handoffs per contact per rolling day
    pub daily_cap: u32,
    /// Executed handoffs per source→target route per rolling hour, all contacts
    pub route_hourly_cap: u32,
    /// Handoffs per contact per hour still allowed while counters are unavailable
    pub degraded_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_cap: 3,
            daily_cap: 10,
            route_hourly_cap: 500,
            degraded_burst: 1,
        }
    }
}

/// Ping-pong and chain-depth protection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircularConfig {
    /// Window in which a pair (or its reverse) may not fire again
    pub cooldown_secs: u64,
    /// Executed handoffs allowed before forced escalation
    pub max_depth: u32,
}

impl Default for CircularConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30 * 60,
            max_depth: 3,
        }
    }
}

impl CircularConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

/// P95 latency SLA per automated agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSla {
    pub lead_ms: u64,
    pub buyer_ms: u64,
    pub seller_ms: u64,
}

impl Default for AgentSla {
    fn default() -> Self {
        Self {
            lead_ms: 2_000,
            buyer_ms: 2_500,
            seller_ms: 2_500,
        }
    }
}

impl AgentSla {
    /// SLA for `agent`; `None` for the human operator
    pub fn for_agent(&self, agent: AgentKind) -> Option<u64> {
        match agent {
            AgentKind::Lead => Some(self.lead_ms),
            AgentKind::Buyer => Some(self.buyer_ms),
            AgentKind::Seller => Some(self.seller_ms),
            AgentKind::Human => None,
        }
    }
}

/// Agent health evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Freshness window for samples
    pub window_secs: u64,
    /// Fewer fresh samples than this means health is unknown
    pub min_samples: usize,
    /// Samples retained per agent
    pub max_samples: usize,
    /// P95 may reach `sla * sla_tolerance` before the agent is degraded
    pub sla_tolerance: f64,
    /// Error rate above which the agent is degraded
    pub error_rate_ceiling: f64,
    pub sla: AgentSla,
    /// Bounded capacity of the reporting channel
    pub channel_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_secs: 5 * 60,
            min_samples: 5,
            max_samples: 200,
            sla_tolerance: 1.2,
            error_rate_ceiling: 0.10,
            sla: AgentSla::default(),
            channel_capacity: 1024,
        }
    }
}

impl HealthConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }
}

/// Contact lock behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub acquire_timeout_ms: u64,
    /// Lease lifetime; must cover the worst-case execute step
    pub lease_ttl_ms: u64,
    /// Contentions on one contact within the window before a race warning
    pub contention_warn_threshold: u32,
    pub contention_window_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 250,
            lease_ttl_ms: 5_000,
            contention_warn_threshold: 3,
            contention_window_secs: 60,
        }
    }
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease_ttl_ms as i64)
    }

    pub fn contention_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.contention_window_secs as i64)
    }
}

/// Context package bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub ttl_secs: u64,
    pub max_facts: usize,
    pub max_scores: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            max_facts: 64,
            max_scores: 32,
        }
    }
}

impl ContextConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

/// Threshold learning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    /// Samples required before a key's threshold may move
    pub min_samples: u64,
    pub threshold_min: f64,
    pub threshold_max: f64,
    /// Precision the adjustment steers toward
    pub target_precision: f64,
    /// Threshold change per unit of precision error
    pub gain: f64,
    /// How long an executed handoff waits for outcome feedback
    pub feedback_window_secs: u64,
    /// Bounded capacity of the feedback channel
    pub channel_capacity: usize,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            threshold_min: 0.6,
            threshold_max: 0.85,
            target_precision: 0.8,
            gain: 0.5,
            feedback_window_secs: 7 * 24 * 60 * 60,
            channel_capacity: 1024,
        }
    }
}

impl LearnerConfig {
    pub fn feedback_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.feedback_window_secs as i64)
    }

    pub fn clamp(&self, threshold: f64) -> f64 {
        threshold.max(self.threshold_min).min(self.threshold_max)
    }
}

/// Evaluation time budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    /// Budget for each individual backend call
    pub gate_timeout_ms: u64,
    /// Budget for everything before execution
    pub evaluation_deadline_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            gate_timeout_ms: 50,
            evaluation_deadline_ms: 300,
        }
    }
}

impl DeadlineConfig {
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }

    pub fn evaluation_deadline(&self) -> Duration {
        Duration::from_millis(self.evaluation_deadline_ms)
    }
}

/// CRM tags marking which agent owns a contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagConfig {
    pub lead: String,
    pub buyer: String,
    pub seller: String,
    pub human: String,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            lead: "Needs Qualifying".to_string(),
            buyer: "Buyer-Lead".to_string(),
            seller: "Needs Qualifying".to_string(),
            human: "Human-Escalation".to_string(),
        }
    }
}

impl TagConfig {
    pub fn for_agent(&self, agent: AgentKind) -> &str {
        match agent {
            AgentKind::Lead => &self.lead,
            AgentKind::Buyer => &self.buyer,
            AgentKind::Seller => &self.seller,
            AgentKind::Human => &self.human,
        }
    }
}

impl HandoffConfig {
    /// Parse a TOML document
    pub fn from_toml_str(raw: &str) -> HandoffResult<Self> {
        toml::from_str(raw).map_err(|e| HandoffError::config(e.to_string()))
    }

    /// Read a TOML file
    pub fn from_file(path: &Path) -> HandoffResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// File (or defaults) → environment overrides → validation
    pub fn load(path: Option<&Path>) -> HandoffResult<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HANDOFF_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> HandoffResult<()> {
        if let Some(v) = env_parse::<f64>("HANDOFF_DEFAULT_THRESHOLD")? {
            self.routing.default_threshold = v;
        }
        if let Some(v) = env_parse::<u32>("HANDOFF_HOURLY_CAP")? {
            self.rate_limit.hourly_cap = v;
        }
        if let Some(v) = env_parse::<u32>("HANDOFF_DAILY_CAP")? {
            self.rate_limit.daily_cap = v;
        }
        if let Some(v) = env_parse::<u32>("HANDOFF_MAX_DEPTH")? {
            self.circular.max_depth = v;
        }
        if let Some(v) = env_parse::<u64>("HANDOFF_COOLDOWN_SECS")? {
            self.circular.cooldown_secs = v;
        }
        if let Some(v) = env_parse::<u64>("HANDOFF_EVALUATION_DEADLINE_MS")? {
            self.deadlines.evaluation_deadline_ms = v;
        }
        Ok(())
    }

    /// Reject settings that would make the gates incoherent
    pub fn validate(&self) -> HandoffResult<()> {
        let l = &self.learner;
        let unit = 0.0..=1.0;
        if !unit.contains(&l.threshold_min) || !unit.contains(&l.threshold_max) {
            return Err(HandoffError::config("learner clamp must lie within [0, 1]"));
        }
        if l.threshold_min > l.threshold_max {
            return Err(HandoffError::config("learner threshold_min exceeds threshold_max"));
        }
        let base = self.routing.default_threshold;
        if base < l.threshold_min || base > l.threshold_max {
            return Err(HandoffError::config(format!(
                "default threshold {} outside learner clamp [{}, {}]",
                base, l.threshold_min, l.threshold_max
            )));
        }
        if let Some(r) = self
            .routing
            .route_thresholds
            .iter()
            .find(|r| r.threshold < l.threshold_min || r.threshold > l.threshold_max)
        {
            return Err(HandoffError::config(format!(
                "route {}->{} threshold {} outside learner clamp [{}, {}]",
                r.source, r.target, r.threshold, l.threshold_min, l.threshold_max
            )));
        }
        if !self.routing.entry_agent.is_automated() {
            return Err(HandoffError::config("entry agent must be automated"));
        }

        let rl = &self.rate_limit;
        if rl.hourly_cap == 0 || rl.daily_cap == 0 || rl.route_hourly_cap == 0 {
            return Err(HandoffError::config("rate limit caps must be positive"));
        }
        if rl.daily_cap < rl.hourly_cap {
            return Err(HandoffError::config("daily cap below hourly cap"));
        }

        if self.lock.lease_ttl_ms <= self.lock.acquire_timeout_ms {
            return Err(HandoffError::config(
                "lock lease must outlive the acquisition timeout",
            ));
        }
        if self.health.min_samples == 0 || self.health.max_samples < self.health.min_samples {
            return Err(HandoffError::config(
                "health max_samples must be at least min_samples (> 0)",
            ));
        }
        if self.deadlines.gate_timeout_ms == 0 || self.deadlines.evaluation_deadline_ms == 0 {
            return Err(HandoffError::config("deadlines must be positive"));
        }
        debug!("handoff config validated");
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> HandoffResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| HandoffError::config(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}
