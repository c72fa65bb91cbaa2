//! Identifiers and statistics shared by exchanges and mailboxes

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    /// Create a new random query ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", &self.0.to_string()[..8])
    }
}

/// Address of one directed channel between two stage instances
///
/// Unique per destination within one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxId {
    pub query_id: QueryId,
    pub sender_stage: u32,
    pub sender_worker: u32,
    pub receiver_stage: u32,
    pub receiver_worker: u32,
}

impl MailboxId {
    /// Create a mailbox ID
    pub fn new(
        query_id: QueryId,
        sender_stage: u32,
        sender_worker: u32,
        receiver_stage: u32,
        receiver_worker: u32,
    ) -> Self {
        Self {
            query_id,
            sender_stage,
            sender_worker,
            receiver_stage,
            receiver_worker,
        }
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.query_id,
            self.sender_stage,
            self.sender_worker,
            self.receiver_stage,
            self.receiver_worker
        )
    }
}

/// Execution statistics carried by a terminal block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    /// Stage that produced the stats
    pub stage_id: u32,
    /// Rows emitted
    pub rows_emitted: u64,
    /// Blocks emitted
    pub blocks_emitted: u64,
    /// Wall-clock execution time in milliseconds
    pub execution_time_ms: u64,
    /// Named counters
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
}

impl StageStats {
    /// Create empty stats for a stage
    pub fn new(stage_id: u32) -> Self {
        Self {
            stage_id,
            ..Default::default()
        }
    }

    /// Add `value` to a named counter
    pub fn add_counter(&mut self, name: impl Into<String>, value: u64) {
        *self.counters.entry(name.into()).or_insert(0) += value;
    }

    /// Get a named counter
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }

    /// Fold another set of stats into this one
    pub fn merge(&mut self, other: &StageStats) {
        self.rows_emitted += other.rows_emitted;
        self.blocks_emitted += other.blocks_emitted;
        self.execution_time_ms = self.execution_time_ms.max(other.execution_time_ms);
        for (name, value) in &other.counters {
            self.add_counter(name.clone(), *value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_id_display() {
        let query_id = QueryId::new();
        let id = MailboxId::new(query_id, 1, 2, 0, 3);
        let shown = id.to_string();

        assert!(shown.starts_with("query-"));
        assert!(shown.ends_with("|1|2|0|3"));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(QueryId::new(), QueryId::new());
    }

    #[test]
    fn test_stats_merge() {
        let mut a = StageStats::new(1);
        a.rows_emitted = 10;
        a.execution_time_ms = 5;
        a.add_counter("spilled", 1);

        let mut b = StageStats::new(1);
        b.rows_emitted = 7;
        b.blocks_emitted = 2;
        b.execution_time_ms = 9;
        b.add_counter("spilled", 2);
        b.add_counter("filtered", 4);

        a.merge(&b);
        assert_eq!(a.rows_emitted, 17);
        assert_eq!(a.blocks_emitted, 2);
        assert_eq!(a.execution_time_ms, 9);
        assert_eq!(a.counter("spilled"), Some(3));
        assert_eq!(a.counter("filtered"), Some(4));
    }
}
