//! Handoff state: contacts, transition log, pattern stats, and TTL state
//!
//! # Architecture
//!
//! ```text
//! ContactStore   ── Contact table        keyed by contact_id
//!                ── TransitionRecord log keyed by (contact_id, decided_at)
//!                ── PatternStat table    keyed by (signal_type, target_agent)
//!
//! EphemeralStore ── sliding rate windows  (timestamps, pruned on write)
//!                ── lock leases           (token + expiry)
//! ```
//!
//! The in-memory stores serve single-process deployments. Enable the
//! `durable-state` feature for a RocksDB-backed [`ContactStore`].
//!
//! # Usage
//!
//! ```ignore
//! use handoff_coordination::state::{InMemoryContactStore, InMemoryEphemeralStore};
//!
//! let contacts = InMemoryContactStore::new().shared();
//! let ephemeral = InMemoryEphemeralStore::new().shared();
//! ```

#[cfg(feature = "durable-state")]
pub mod durable;
pub mod expiry;
pub mod schema;
pub mod store;
pub mod types;

#[cfg(feature = "durable-state")]
pub use durable::DurableContactStore;
pub use expiry::{chrono_duration, is_expired, Clock, Expiring, ManualClock, SharedClock, SystemClock};
pub use store::{
    bounded, ContactStore, EphemeralStore, InMemoryContactStore, InMemoryEphemeralStore,
    SharedContactStore, SharedEphemeralStore, StoreError, StoreResult, WindowLimit,
};
pub use types::{
    AgentKind, Contact, ContactId, ContactStatus, HandoffCandidate, PatternKey, PatternStat,
    RoutingStatus, SignalType, TransitionOutcome, TransitionRecord,
};
