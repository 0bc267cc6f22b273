//! The per-peer outbound message queue (spec §4.3) — the hardest
//! subcomponent. An intrusive doubly linked list of queued messages (an
//! arena of nodes linked by index, since safe Rust can't do raw intrusive
//! pointers) plus a lazily built, sorted `qlink` index with tombstone
//! compaction, exactly as spec §9's redesign note describes: "the same
//! structure described abstractly: intrusive doubly linked list of
//! messages plus a lazily built, sorted index with tombstone compaction."

use std::collections::VecDeque;

use gnutella_proto::header::Function;
use tracing::{debug, warn};

use crate::config::MqConfig;
use crate::message::{Priority, QueuedMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    None,
    WarnZone,
    FlowControl,
}

/// Events the MQ raises as `size` crosses watermarks or messages are culled.
/// Consumed by the peer session to drive logging and bye decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqEvent {
    EnterWarnZone,
    LeaveWarnZone,
    EnterFlowControl,
    LeaveFlowControl,
    EnterSwift,
    LeaveSwift,
    TxDrop { function: Function, bytes: usize },
    /// Enqueuing would exceed `maxsize` and make-room failed: the caller
    /// must terminate the session with a 502 bye (spec §4.3).
    MaxsizeExceeded { attempted_bytes: usize },
}

struct Node {
    msg: QueuedMessage,
    prev: Option<usize>,
    next: Option<usize>,
}

/// The outbound message queue for one peer.
///
/// List orientation: `tail` is the next message to write to the link
/// (spec: "dequeuing in FIFO order... read from tail"); `head` is where new
/// normal-priority messages are appended. Higher ("control") priority
/// messages are spliced in near `tail`, after any message currently being
/// written, ahead of every already-queued normal-priority message.
pub struct OutboundQueue {
    config: MqConfig,
    arena: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    size: usize,
    count: usize,
    next_seq: u64,
    pending_link_bytes: usize,

    /// Sorted auxiliary index: `Some(arena_idx)` for a live entry, `None`
    /// for a tombstone. Built lazily on first eviction after entering
    /// flow-control (spec §4.3); dropped again on leaving flow-control.
    qlink: Option<Vec<Option<usize>>>,
    live_in_qlink: usize,
    tombstones: usize,

    state: FlowState,
    swift: bool,
    swift_deadline_ms: Option<i64>,
    swift_cycle: u32,
    flushed_since_checkpoint: usize,
    added_since_checkpoint: usize,
    last_checkpoint_ms: i64,

    discard: bool,
    shutdown: bool,

    pub tx_drops: u64,

    events: VecDeque<MqEvent>,
}

impl OutboundQueue {
    pub fn new(config: MqConfig, now_ms: i64) -> Self {
        Self {
            config,
            arena: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            size: 0,
            count: 0,
            next_seq: 0,
            pending_link_bytes: 0,
            qlink: None,
            live_in_qlink: 0,
            tombstones: 0,
            state: FlowState::None,
            swift: false,
            swift_deadline_ms: None,
            swift_cycle: 0,
            flushed_since_checkpoint: 0,
            added_since_checkpoint: 0,
            last_checkpoint_ms: now_ms,
            discard: false,
            shutdown: false,
            tx_drops: 0,
            events: VecDeque::new(),
        }
    }

    // --- observers ---

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `size` plus whatever bytes a lower link stage (compressor, socket
    /// send buffer) has accepted but not yet confirmed written.
    pub fn pending(&self) -> usize {
        self.size + self.pending_link_bytes
    }

    pub fn set_pending_link_bytes(&mut self, bytes: usize) {
        self.pending_link_bytes = bytes;
    }

    pub fn is_flow_controlled(&self) -> bool {
        self.state == FlowState::FlowControl
    }

    pub fn is_swift_controlled(&self) -> bool {
        self.swift
    }

    pub fn next_event(&mut self) -> Option<MqEvent> {
        self.events.pop_front()
    }

    // --- arena / list plumbing ---

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            self.arena[idx] = Some(node);
            idx
        } else {
            self.arena.push(Some(node));
            self.arena.len() - 1
        }
    }

    fn dealloc(&mut self, idx: usize) -> QueuedMessage {
        let node = self.arena[idx].take().expect("dealloc of live index");
        self.free.push(idx);
        node.msg
    }

    fn node(&self, idx: usize) -> &Node {
        self.arena[idx].as_ref().expect("dangling index")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.arena[idx].as_mut().expect("dangling index")
    }

    fn push_back(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(h) = old_head {
            self.node_mut(h).next = Some(idx);
        }
        self.node_mut(idx).prev = old_head;
        self.node_mut(idx).next = None;
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    /// Insert `idx` right after `anchor` (or at the true front if `anchor`
    /// is `None`).
    fn insert_after(&mut self, anchor: Option<usize>, idx: usize) {
        match anchor {
            None => {
                let old_tail = self.tail;
                self.node_mut(idx).prev = None;
                self.node_mut(idx).next = old_tail;
                if let Some(t) = old_tail {
                    self.node_mut(t).prev = Some(idx);
                }
                self.tail = Some(idx);
                if self.head.is_none() {
                    self.head = Some(idx);
                }
            }
            Some(a) => {
                let a_next = self.node(a).next;
                self.node_mut(idx).prev = Some(a);
                self.node_mut(idx).next = a_next;
                self.node_mut(a).next = Some(idx);
                match a_next {
                    Some(n) => self.node_mut(n).prev = Some(idx),
                    None => self.head = Some(idx),
                }
            }
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let n = self.node(idx);
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.tail = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.head = prev,
        }
    }

    /// Where a new control-priority message should be spliced in: after the
    /// last already-queued control message, or after the in-flight
    /// partially-written item if there is no control message yet, or at
    /// the true front if there's neither.
    fn find_control_insert_point(&self) -> Option<usize> {
        let mut anchor = None;
        let mut cursor = self.tail;
        if let Some(t) = cursor {
            if self.node(t).msg.is_partially_written() {
                anchor = Some(t);
                cursor = self.node(t).next;
            }
        }
        while let Some(c) = cursor {
            if self.node(c).msg.priority == Priority::Control {
                anchor = Some(c);
                cursor = self.node(c).next;
            } else {
                break;
            }
        }
        anchor
    }

    fn iter_indices(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.count);
        let mut cursor = self.tail;
        while let Some(c) = cursor {
            out.push(c);
            cursor = self.node(c).next;
        }
        out
    }

    // --- public queue contract (spec §4.3) ---

    /// Enqueue `bytes` framed for `function`. Returns `None` if the queue is
    /// discarding (post-`discard()`) or the message was dropped under
    /// backpressure; otherwise the assigned sequence number.
    pub fn put(&mut self, function: Function, bytes: Vec<u8>, ttl: u8, hops: u8, now_ms: i64) -> Option<u64> {
        if self.discard || self.shutdown {
            return None;
        }
        let priority = Priority::of_function(function);
        let size = bytes.len();

        if self.state == FlowState::FlowControl && priority == Priority::Normal && function.is_droppable() {
            if !self.make_room(size, priority) {
                self.tx_drops += 1;
                self.events.push_back(MqEvent::TxDrop { function, bytes: size });
                warn!(?function, bytes = size, "flow-controlled normal-priority message dropped");
                return None;
            }
        } else if self.size + size > self.config.maxsize {
            if !self.make_room(size, priority) {
                self.events
                    .push_back(MqEvent::MaxsizeExceeded { attempted_bytes: size });
                warn!(?function, bytes = size, "maxsize exceeded and make-room failed");
                return None;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let msg = QueuedMessage::new(priority, function, seq, bytes, ttl, hops);
        let idx = self.alloc(Node {
            msg,
            prev: None,
            next: None,
        });
        match priority {
            Priority::Normal => self.push_back(idx),
            Priority::Control => {
                let anchor = self.find_control_insert_point();
                self.insert_after(anchor, idx);
            }
        }
        self.size += size;
        self.count += 1;
        self.added_since_checkpoint += size;
        if let Some(_) = &self.qlink {
            self.qlink_insert(idx);
        }
        self.update_flow_state(now_ms);
        Some(seq)
    }

    /// Drop all unsent messages; the partially-written tail item (if any)
    /// is retained so the stream stays framed (spec §4.3 `clear()`).
    pub fn clear(&mut self) {
        let keep = self.tail.filter(|&t| self.node(t).msg.is_partially_written());
        let mut cursor = self.tail;
        while let Some(c) = cursor {
            let next = self.node(c).next;
            if Some(c) != keep {
                let size = self.node(c).msg.size();
                self.unlink(c);
                self.qlink_tombstone(c);
                self.dealloc(c);
                self.size -= size;
                self.count -= 1;
            }
            cursor = next;
        }
    }

    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub fn shutdown(&mut self) {
        self.shutdown = true;
    }

    /// The next bytes to write to the link, and the seq of the message they
    /// belong to (so the caller can call `mark_written`).
    pub fn peek_write(&self) -> Option<(u64, &[u8])> {
        let idx = self.tail?;
        let msg = &self.node(idx).msg;
        Some((msg.seq, msg.remaining()))
    }

    /// Record that `written` bytes of the head-of-line message were
    /// accepted by the link. Fully-written messages are dequeued.
    pub fn mark_written(&mut self, written: usize, now_ms: i64) {
        let Some(idx) = self.tail else { return };
        self.node_mut(idx).msg.advance(written);
        self.size -= written;
        self.flushed_since_checkpoint += written;
        if self.node(idx).msg.is_fully_written() {
            self.unlink(idx);
            self.qlink_tombstone(idx);
            self.dealloc(idx);
            self.count -= 1;
        }
        self.update_flow_state(now_ms);
    }

    // --- flow control state machine (spec §4.3) ---

    fn update_flow_state(&mut self, now_ms: i64) {
        match self.state {
            FlowState::None => {
                if self.size >= self.config.hiwat {
                    self.enter_flow_control(now_ms);
                } else if self.size >= self.config.lowat {
                    self.state = FlowState::WarnZone;
                    self.events.push_back(MqEvent::EnterWarnZone);
                }
            }
            FlowState::WarnZone => {
                if self.size >= self.config.hiwat {
                    self.enter_flow_control(now_ms);
                } else if self.size < self.config.lowat {
                    self.state = FlowState::None;
                    self.events.push_back(MqEvent::LeaveWarnZone);
                }
            }
            FlowState::FlowControl => {
                if self.size <= self.config.lowat {
                    self.leave_flow_control();
                }
            }
        }
    }

    fn enter_flow_control(&mut self, now_ms: i64) {
        self.state = FlowState::FlowControl;
        self.swift_deadline_ms = Some(now_ms + self.config.swift_grace.as_millis() as i64);
        self.events.push_back(MqEvent::EnterFlowControl);
        debug!(size = self.size, hiwat = self.config.hiwat, "entered flow control");
    }

    fn leave_flow_control(&mut self) {
        self.state = FlowState::None;
        self.events.push_back(MqEvent::LeaveFlowControl);
        debug!(size = self.size, "left flow control");
        if self.swift {
            self.swift = false;
            self.events.push_back(MqEvent::LeaveSwift);
        }
        self.swift_deadline_ms = None;
        self.swift_cycle = 0;
        self.qlink = None;
        self.live_in_qlink = 0;
        self.tombstones = 0;
    }

    /// Called periodically (spec §4.3's grace timer). Escalates to swift
    /// mode once the grace window since entering flow-control has elapsed.
    pub fn check_swift_deadline(&mut self, now_ms: i64) {
        if self.state == FlowState::FlowControl && !self.swift {
            if let Some(deadline) = self.swift_deadline_ms {
                if now_ms >= deadline {
                    self.swift = true;
                    self.events.push_back(MqEvent::EnterSwift);
                    warn!("swift-mode grace window elapsed, entering swift culling");
                }
            }
        }
    }

    /// Run one swift-mode checkpoint (spec §4.3's target formula) and cull
    /// messages until the computed target is reached. `elapsed_ms` and
    /// `next_period_ms` are the observed and configured checkpoint
    /// intervals.
    pub fn run_swift_checkpoint(&mut self, elapsed_ms: i64, next_period_ms: i64) {
        if !self.swift {
            return;
        }
        let elapsed = elapsed_ms.max(1) as f64;
        let next = next_period_ms.max(1) as f64;
        let ratio = next / elapsed;
        let flushed_next = self.flushed_since_checkpoint as f64 * ratio;
        let added_next = self.added_since_checkpoint as f64 * ratio;
        let target = self.size.saturating_sub(self.config.lowat) as f64;
        let extra = target - (flushed_next - added_next);

        let drop_target = if extra <= 0.0 {
            (target / 3.0).max(0.0)
        } else {
            extra + flushed_next / 4.0
        } as usize;

        self.flushed_since_checkpoint = 0;
        self.added_since_checkpoint = 0;

        if drop_target == 0 {
            return;
        }
        self.cull_swift(drop_target);
        self.swift_cycle += 1;
    }

    /// First swift cycle targets pending queries at hops=1 and the highest
    /// TTL seen; later cycles target query-hits, scanning from the lowest
    /// priority (high TTL, low hops) upward (spec §4.3).
    fn cull_swift(&mut self, mut target_bytes: usize) {
        self.ensure_qlink();
        let wants_query = self.swift_cycle == 0;
        let max_ttl = self
            .iter_indices()
            .iter()
            .map(|&i| self.node(i).msg.ttl)
            .max()
            .unwrap_or(0);

        let candidates: Vec<usize> = self.iter_indices();
        let mut ordered: Vec<usize> = candidates
            .into_iter()
            .filter(|&i| {
                let m = &self.node(i).msg;
                if m.is_partially_written() {
                    return false;
                }
                if wants_query {
                    m.function == Function::Query && m.hops == 1 && m.ttl == max_ttl
                } else {
                    m.function == Function::QueryHit
                }
            })
            .collect();
        // "scanning over hops from lowest priority (high TTL, low hops)
        // upward": sort by ttl descending, then hops ascending.
        ordered.sort_by(|&a, &b| {
            let ma = &self.node(a).msg;
            let mb = &self.node(b).msg;
            mb.ttl.cmp(&ma.ttl).then(ma.hops.cmp(&mb.hops))
        });

        for idx in ordered {
            if target_bytes == 0 {
                break;
            }
            let (size, function) = {
                let m = &self.node(idx).msg;
                (m.size(), m.function)
            };
            self.unlink(idx);
            self.qlink_tombstone(idx);
            self.dealloc(idx);
            self.size -= size;
            self.count -= 1;
            self.tx_drops += 1;
            self.events.push_back(MqEvent::TxDrop { function, bytes: size });
            target_bytes = target_bytes.saturating_sub(size);
        }
    }

    /// Evict strictly-lower-priority messages to make room for `needed`
    /// bytes, walking `qlink` from the lowest priority upward, skipping any
    /// partially-written item, stopping once enough bytes are freed or a
    /// message at `inserting_priority` or higher is reached (spec §4.3).
    /// With only two priority tiers, inserting at `Priority::Normal` (the
    /// lowest tier) has no strictly-lower tier to evict from, so this stops
    /// immediately and evicts nothing.
    fn make_room(&mut self, needed: usize, inserting_priority: Priority) -> bool {
        self.ensure_qlink();
        let mut freed = 0usize;
        let mut to_remove = Vec::new();

        if let Some(qlink) = &self.qlink {
            for slot in qlink.iter() {
                if freed >= needed {
                    break;
                }
                let Some(idx) = slot else { continue };
                let msg = &self.node(*idx).msg;
                if msg.priority >= inserting_priority {
                    break;
                }
                if msg.is_partially_written() {
                    continue;
                }
                freed += msg.size();
                to_remove.push(*idx);
            }
        }

        if freed < needed {
            return false;
        }

        for idx in to_remove {
            let (size, function) = {
                let m = &self.node(idx).msg;
                (m.size(), m.function)
            };
            self.unlink(idx);
            self.qlink_tombstone(idx);
            self.dealloc(idx);
            self.size -= size;
            self.count -= 1;
            self.tx_drops += 1;
            self.events.push_back(MqEvent::TxDrop { function, bytes: size });
            debug!(?function, bytes = size, "evicted to make room");
        }
        true
    }

    // --- qlink: lazily-built sorted index with tombstone compaction ---

    fn sort_key(&self, idx: usize) -> (Priority, u64) {
        let m = &self.node(idx).msg;
        (m.priority, m.seq)
    }

    fn ensure_qlink(&mut self) {
        if self.qlink.is_some() {
            return;
        }
        let mut entries = self.iter_indices();
        entries.sort_by_key(|&i| self.sort_key(i));
        self.live_in_qlink = entries.len();
        self.tombstones = 0;
        self.qlink = Some(entries.into_iter().map(Some).collect());
    }

    /// Tombstone-tolerant search for nearest live entry to `mid`, scanning
    /// outward in both directions (spec §9: "scanning forward/backward to
    /// the nearest non-tombstone to choose a side").
    fn nearest_live(qlink: &[Option<usize>], mid: usize) -> Option<usize> {
        if qlink.is_empty() {
            return None;
        }
        let mut left = mid as isize;
        let mut right = mid;
        loop {
            if left >= 0 {
                if let Some(v) = qlink[left as usize] {
                    return Some(v);
                }
            }
            if right < qlink.len() {
                if let Some(v) = qlink[right] {
                    return Some(v);
                }
            }
            if left < 0 && right >= qlink.len() {
                return None;
            }
            left -= 1;
            right += 1;
        }
    }

    fn qlink_insert(&mut self, idx: usize) {
        let key = self.sort_key(idx);
        let pos = {
            let qlink = self.qlink.as_ref().unwrap();
            let mut lo = 0usize;
            let mut hi = qlink.len();
            while lo < hi {
                let mid = (lo + hi) / 2;
                match Self::nearest_live(qlink, mid) {
                    None => hi = mid,
                    Some(live_idx) => {
                        if self.sort_key(live_idx) <= key {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                }
            }
            lo
        };
        self.qlink.as_mut().unwrap().insert(pos, Some(idx));
        self.live_in_qlink += 1;
    }

    fn qlink_tombstone(&mut self, idx: usize) {
        let Some(qlink) = &mut self.qlink else { return };
        if let Some(slot) = qlink.iter_mut().find(|s| **s == Some(idx)) {
            *slot = None;
            self.tombstones += 1;
            self.live_in_qlink = self.live_in_qlink.saturating_sub(1);
        }
        if self.tombstones > self.config.tombstone_compaction_ratio * self.live_in_qlink.max(1) {
            self.compact_qlink();
        }
    }

    fn compact_qlink(&mut self) {
        if let Some(qlink) = &mut self.qlink {
            qlink.retain(|s| s.is_some());
            self.tombstones = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q() -> OutboundQueue {
        OutboundQueue::new(
            MqConfig {
                lowat: 5_000,
                hiwat: 9_000,
                maxsize: 10_000,
                ..MqConfig::default()
            },
            0,
        )
    }

    #[test]
    fn size_accounting_matches_sum_of_payloads() {
        let mut mq = q();
        mq.put(Function::Query, vec![0u8; 100], 4, 0, 0);
        mq.put(Function::Query, vec![0u8; 50], 4, 0, 0);
        assert_eq!(mq.size(), 150);
        assert_eq!(mq.count(), 2);
    }

    #[test]
    fn partial_write_is_retained_by_clear() {
        let mut mq = q();
        mq.put(Function::Query, vec![0u8; 10], 4, 0, 0);
        mq.mark_written(5, 0);
        mq.put(Function::Query, vec![0u8; 10], 4, 0, 0);
        mq.clear();
        assert_eq!(mq.count(), 1);
        let (_, remaining) = mq.peek_write().unwrap();
        assert_eq!(remaining.len(), 5);
    }

    #[test]
    fn priority_order_is_non_decreasing() {
        let mut mq = q();
        mq.put(Function::Query, vec![0u8; 10], 4, 0, 0); // Normal
        mq.put(Function::Push, vec![0u8; 10], 1, 0, 0); // Control
        mq.put(Function::Query, vec![0u8; 10], 4, 0, 0); // Normal
        // Control message should now be first to drain (tail).
        let (seq, _) = mq.peek_write().unwrap();
        assert_eq!(seq, 1);
    }

    #[test]
    fn flow_control_hysteresis_fires_each_transition_once() {
        let mut mq = q();
        let mut events = Vec::new();
        for _ in 0..9 {
            mq.put(Function::Query, vec![0u8; 1000], 4, 0, 0);
            while let Some(ev) = mq.next_event() {
                events.push(ev);
            }
        }
        assert!(events.contains(&MqEvent::EnterWarnZone));
        assert!(events.contains(&MqEvent::EnterFlowControl));
        assert_eq!(
            events.iter().filter(|e| **e == MqEvent::EnterFlowControl).count(),
            1
        );
    }

    #[test]
    fn s2_make_room_eviction_fixture() {
        // Adapted from spec §8 S2 (hiwat=9000, maxsize=10000, lowat=5000):
        // fill to just under maxsize with droppable queries, then enqueue
        // a run of non-droppable pushes that would cross maxsize. Expect
        // make-room eviction of queries ahead of session termination, and
        // the TX-drop counter to move.
        let mut mq = OutboundQueue::new(
            MqConfig {
                lowat: 5_000,
                hiwat: 9_000,
                maxsize: 10_000,
                ..MqConfig::default()
            },
            0,
        );
        for _ in 0..98 {
            mq.put(Function::Query, vec![0u8; 100], 4, 1, 0);
        }
        while mq.next_event().is_some() {}
        assert_eq!(mq.size(), 9800);
        assert!(mq.is_flow_controlled());
        let queries_before = mq.count();

        // This push alone fits under maxsize; a second one would not, and
        // must trigger make-room eviction of lower-priority queries.
        mq.put(Function::Push, vec![0u8; 100], 1, 0, 0);
        assert_eq!(mq.size(), 9900);
        mq.put(Function::Push, vec![0u8; 300], 1, 0, 0);
        while mq.next_event().is_some() {}
        assert!(
            mq.count() < queries_before + 2,
            "a lower-priority query must have been evicted to admit the second push"
        );
        assert!(mq.tx_drops >= 1);
    }
}
