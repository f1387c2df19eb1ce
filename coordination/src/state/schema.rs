//! Column family definitions for the durable handoff store
//!
//! Each column family provides logical separation of data types
//! while sharing the same RocksDB instance.

/// Column family for the Contact table
pub const CF_CONTACTS: &str = "contacts";

/// Column family for the per-contact transition log
pub const CF_TRANSITIONS: &str = "transitions";

/// Column family indexing the transition log by decision time
pub const CF_TIMELINE: &str = "timeline";

/// Column family for learned pattern statistics
pub const CF_PATTERNS: &str = "patterns";

/// All column family names
pub const ALL_CFS: &[&str] = &[CF_CONTACTS, CF_TRANSITIONS, CF_TIMELINE, CF_PATTERNS];

/// Key builders for compound keys
pub mod keys {
    use chrono::{DateTime, Utc};

    /// Zero-padded nanoseconds so lexical order matches time order
    fn nanos(at: DateTime<Utc>) -> String {
        format!("{:020}", at.timestamp_nanos_opt().unwrap_or(0).max(0))
    }

    /// Create a contact key
    pub fn contact(contact_id: &str) -> String {
        format!("contact:{}", contact_id)
    }

    /// Prefix shared by one contact's transition keys.
    ///
    /// The id is length-prefixed so `a` never matches the log of `a:b`.
    pub fn transition_prefix(contact_id: &str) -> String {
        format!("tx:{}:{}:", contact_id.len(), contact_id)
    }

    /// Create a transition key
    pub fn transition(contact_id: &str, decided_at: DateTime<Utc>, record_id: &str) -> String {
        format!(
            "{}{}:{}",
            transition_prefix(contact_id),
            nanos(decided_at),
            record_id
        )
    }

    /// Create a timeline key
    pub fn timeline(decided_at: DateTime<Utc>, record_id: &str) -> String {
        format!("{}:{}", nanos(decided_at), record_id)
    }

    /// Lower bound for timeline scans starting at `at`
    pub fn timeline_start(at: DateTime<Utc>) -> String {
        nanos(at)
    }

    /// Create a pattern key
    pub fn pattern(signal_type: &str, target_agent: &str) -> String {
        format!("pattern:{}:{}", target_agent, signal_type)
    }
}

#[cfg(test)]
mod tests {
    use super::keys;
    use chrono::{Duration, Utc};

    #[test]
    fn test_transition_keys_sort_by_time() {
        let t0 = Utc::now();
        let a = keys::transition("c1", t0, "x");
        let b = keys::transition("c1", t0 + Duration::milliseconds(1), "a");
        assert!(a < b);
        assert!(a.starts_with(&keys::transition_prefix("c1")));
    }

    #[test]
    fn test_prefix_does_not_leak_across_contacts() {
        let t0 = Utc::now();
        let nested = keys::transition("a:b", t0, "x");
        assert!(!nested.starts_with(&keys::transition_prefix("a")));
    }
}
