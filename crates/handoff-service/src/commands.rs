//! JSON-lines command protocol
//!
//! One request object per input line, tagged by `op`; one response object per
//! output line:
//!
//! ```text
//! {"op":"evaluate","candidate":{"contact_id":"c1","source_agent":"lead","target_agent":"buyer","confidence":0.85,"signal_type":"budget_mention"}}
//! {"ok":true,"result":{"decision":"allowed",...}}
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use handoff_coordination::{
    AgentHealthSample, AgentKind, ContactId, ConversationSnapshot, HandoffCandidate,
    HandoffCoordinator, HandoffFeedback, HealthReporter, SignalType,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Candidate as sent on the wire; `observed_at` defaults to receipt time
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateInput {
    pub contact_id: ContactId,
    pub source_agent: AgentKind,
    pub target_agent: AgentKind,
    pub confidence: f64,
    pub signal_type: SignalType,
    #[serde(default)]
    pub signal_excerpt: String,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl CandidateInput {
    fn into_candidate(self, now: DateTime<Utc>) -> HandoffCandidate {
        HandoffCandidate::new(
            self.contact_id,
            self.source_agent,
            self.target_agent,
            self.confidence,
            self.signal_type,
            self.observed_at.unwrap_or(now),
        )
        .with_excerpt(self.signal_excerpt)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Evaluate {
        candidate: CandidateInput,
        #[serde(default)]
        snapshot: ConversationSnapshot,
    },
    Status {
        contact_id: ContactId,
    },
    ResetEscalation {
        contact_id: ContactId,
    },
    Close {
        contact_id: ContactId,
    },
    HealthSample {
        sample: AgentHealthSample,
    },
    Health,
    Feedback {
        transition_id: Uuid,
        feedback: HandoffFeedback,
    },
    ClaimContext {
        contact_id: ContactId,
        agent: AgentKind,
    },
    History {
        contact_id: ContactId,
    },
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(error: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(format!("{:#}", error)),
        }
    }
}

/// Dispatches parsed commands against a running coordinator
pub struct CommandHandler {
    coordinator: std::sync::Arc<HandoffCoordinator>,
    reporter: HealthReporter,
}

impl CommandHandler {
    pub fn new(coordinator: std::sync::Arc<HandoffCoordinator>, reporter: HealthReporter) -> Self {
        Self {
            coordinator,
            reporter,
        }
    }

    /// Parse and run one input line; never fails, errors become responses
    pub async fn handle_line(&self, line: &str) -> Response {
        let command = match serde_json::from_str::<Command>(line).context("malformed command") {
            Ok(command) => command,
            Err(e) => return Response::error(e),
        };
        match self.dispatch(command).await {
            Ok(result) => Response::ok(result),
            Err(e) => Response::error(e),
        }
    }

    async fn dispatch(&self, command: Command) -> Result<Value> {
        let coordinator = &self.coordinator;
        let value = match command {
            Command::Evaluate {
                candidate,
                snapshot,
            } => {
                let candidate = candidate.into_candidate(Utc::now());
                serde_json::to_value(coordinator.evaluate_with_snapshot(candidate, snapshot).await)?
            }
            Command::Status { contact_id } => {
                serde_json::to_value(coordinator.contact_status(&contact_id).await?)?
            }
            Command::ResetEscalation { contact_id } => {
                serde_json::to_value(coordinator.reset_escalation(&contact_id).await?)?
            }
            Command::Close { contact_id } => {
                serde_json::to_value(coordinator.close_contact(&contact_id).await?)?
            }
            Command::HealthSample { sample } => json!({ "accepted": self.reporter.report(sample) }),
            Command::Health => serde_json::to_value(coordinator.health_registry().summary())?,
            Command::Feedback {
                transition_id,
                feedback,
            } => {
                coordinator.record_feedback(transition_id, feedback)?;
                json!({ "accepted": true })
            }
            Command::ClaimContext { contact_id, agent } => {
                serde_json::to_value(coordinator.claim_context(&contact_id, agent))?
            }
            Command::History { contact_id } => {
                serde_json::to_value(coordinator.history().for_contact(&contact_id).await?)?
            }
        };
        Ok(value)
    }
}
