//! Audit and metrics stream for handoff decisions
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): `HandoffEvent`, one variant per
//!    observable change.
//!
//! 2. **Event Bus** (`bus.rs`): Tokio broadcast pub/sub for live consumers
//!    (the pattern learner, audit sinks, dashboards).
//!
//! 3. **Transition History** (`history.rs`): queries and replay over the
//!    durable transition log.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Coordinator  │────▶│  Event Bus   │────▶│  Subscribers │
//! │  (publish)   │     │  (broadcast) │     │   (recv)     │
//! └──────┬───────┘     └──────────────┘     └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐     ┌──────────────┐
//! │ ContactStore │◀────│  History     │
//! │ (append log) │     │  (query)     │
//! └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod history;
pub mod types;

pub use bus::{EventBus, EventBusExt, EventFilter, FilteredReceiver, SharedEventBus};
pub use history::{OutcomeStats, TransitionHistory};
pub use types::{EscalationReason, HandoffEvent};
