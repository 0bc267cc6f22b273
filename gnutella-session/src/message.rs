//! The priority-tagged container the MQ actually stores (spec §3:
//! "(priority, arrival order, payload buffer with read cursor)").

use gnutella_proto::header::Function;

/// Two priority classes the MQ distinguishes (spec §4.3's `put` contract:
/// "Priority: normal (default) or higher").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Normal = 0,
    Control = 1,
}

/// A lower value sorts first in `qlink` (spec §4.3: "Sorted by (priority
/// ascending, then protocol-defined message-importance ascending)");
/// eviction walks from the low end up, so `Normal` (ascending first) is
/// evicted before `Control`. Within a class, `message_importance` is the
/// secondary sort key — lower importance messages (further along in a
/// swift-mode cull sequence) are evicted first.
impl Priority {
    pub fn of_function(function: Function) -> Self {
        if function.is_droppable() {
            Priority::Normal
        } else {
            Priority::Control
        }
    }
}

/// A message queued for transmission on one peer's MQ, with the read
/// cursor that makes partial-write preservation possible (spec invariant
/// 2, §8).
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub priority: Priority,
    pub function: Function,
    /// Monotonically increasing arrival sequence number; the secondary
    /// ordering key within a priority class (FIFO, spec invariant 3).
    pub seq: u64,
    pub bytes: Vec<u8>,
    /// How many bytes of `bytes` have already been written to the link.
    pub cursor: usize,
    /// TTL/hops at the time of enqueue, used by the swift-mode cull target
    /// (spec §4.3: "targets pending queries... with hop-count 1 and max
    /// TTL").
    pub ttl: u8,
    pub hops: u8,
}

impl QueuedMessage {
    pub fn new(priority: Priority, function: Function, seq: u64, bytes: Vec<u8>, ttl: u8, hops: u8) -> Self {
        Self {
            priority,
            function,
            seq,
            bytes,
            cursor: 0,
            ttl,
            hops,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// A message is "partially written" once its cursor has advanced past
    /// the start; such a message must never be dropped (spec invariant 2).
    pub fn is_partially_written(&self) -> bool {
        self.cursor > 0 && self.cursor < self.bytes.len()
    }

    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.cursor..]
    }

    pub fn advance(&mut self, written: usize) {
        self.cursor = (self.cursor + written).min(self.bytes.len());
    }

    pub fn is_fully_written(&self) -> bool {
        self.cursor >= self.bytes.len()
    }
}
