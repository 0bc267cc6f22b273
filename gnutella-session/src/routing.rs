//! Routing table: remembers (message-id, function) -> origin peer for a
//! bounded time, to route replies back and suppress duplicates (spec §3
//! "Routing Entry", §4.6).

use std::collections::HashMap;
use std::time::Duration;

use gnutella_proto::header::{Function, MessageId};

pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RoutingKey {
    message_id: MessageId,
    function: Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingEntry {
    pub origin: PeerId,
    pub ttl_at_entry: u8,
    pub recorded_at_ms: i64,
}

/// Time-bounded (message-id, function) -> origin-peer table.
pub struct RoutingTable {
    entries: HashMap<RoutingKey, RoutingEntry>,
    ttl: Duration,
}

impl RoutingTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Record that `message_id`/`function` arrived from `origin` at
    /// `now_ms`. Returns `true` if this is the first time this key has
    /// been seen within the TTL window (the caller uses this to decide
    /// forward vs suppress-as-duplicate, spec §4.6 step 4).
    pub fn record(
        &mut self,
        message_id: MessageId,
        function: Function,
        origin: PeerId,
        ttl_at_entry: u8,
        now_ms: i64,
    ) -> bool {
        let key = RoutingKey { message_id, function };
        let is_new = match self.entries.get(&key) {
            Some(existing) => (now_ms - existing.recorded_at_ms) as u64 > self.ttl.as_millis() as u64,
            None => true,
        };
        self.entries.insert(
            key,
            RoutingEntry {
                origin,
                ttl_at_entry,
                recorded_at_ms: now_ms,
            },
        );
        is_new
    }

    /// Look up the origin peer to route a reply (pong for a ping,
    /// query-hit for a query, push for an uploader) back toward. Spec
    /// invariant 7: "if no route exists, the hit is dropped."
    pub fn lookup(&self, message_id: &MessageId, function: Function) -> Option<&RoutingEntry> {
        self.entries.get(&RoutingKey {
            message_id: *message_id,
            function,
        })
    }

    pub fn is_duplicate(&self, message_id: &MessageId, function: Function, now_ms: i64) -> bool {
        match self.entries.get(&RoutingKey {
            message_id: *message_id,
            function,
        }) {
            Some(entry) => (now_ms - entry.recorded_at_ms) as u64 <= self.ttl.as_millis() as u64,
            None => false,
        }
    }

    /// Evict entries older than the TTL window. Called from the peer
    /// manager's per-second sweep (spec §4.5).
    pub fn sweep(&mut self, now_ms: i64) {
        let ttl_ms = self.ttl.as_millis() as i64;
        self.entries
            .retain(|_, entry| now_ms - entry.recorded_at_ms <= ttl_ms);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid(b: u8) -> MessageId {
        [b; 16]
    }

    #[test]
    fn routes_a_query_hit_back_to_the_recorded_origin() {
        let mut table = RoutingTable::new(Duration::from_secs(60));
        table.record(mid(1), Function::Query, 42, 4, 1_000);
        let entry = table.lookup(&mid(1), Function::Query).unwrap();
        assert_eq!(entry.origin, 42);
    }

    #[test]
    fn unknown_route_is_absent() {
        let table = RoutingTable::new(Duration::from_secs(60));
        assert!(table.lookup(&mid(9), Function::Query).is_none());
    }

    #[test]
    fn sweep_evicts_expired_entries() {
        let mut table = RoutingTable::new(Duration::from_secs(10));
        table.record(mid(1), Function::Query, 1, 4, 0);
        table.sweep(5_000);
        assert!(table.lookup(&mid(1), Function::Query).is_some());
        table.sweep(20_000);
        assert!(table.lookup(&mid(1), Function::Query).is_none());
    }

    #[test]
    fn duplicate_detection_within_window() {
        let mut table = RoutingTable::new(Duration::from_secs(60));
        assert!(table.record(mid(1), Function::Query, 1, 4, 0));
        assert!(table.is_duplicate(&mid(1), Function::Query, 1_000));
    }
}
