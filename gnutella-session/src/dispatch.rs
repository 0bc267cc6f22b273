//! Per-message dispatch (spec §4.6): validation, TTL/hops policy, routing
//! consultation, and the decision of where (if anywhere) a message goes next.

use gnutella_proto::header::{Function, Message, SizeValidation};
use tracing::trace;

use crate::bye::ByeCode;
use crate::peer_manager::{PeerManager, SelfMode};
use crate::peer_session::PeerMode;
use crate::routing::PeerId;

/// Result of running one inbound message through dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Deliver to our own higher-level handler (search engine, shared-file
    /// answering, etc.) — not this crate's concern.
    Local,
    /// Forward unchanged (TTL/hops already adjusted by the caller) to this
    /// peer.
    Forward(PeerId),
    /// Forward to every connected peer except `from` (broadcast ping/query
    /// on a leaf-less ultra node, or flooding when no routing entry narrows
    /// the target).
    Broadcast,
    /// Silently dropped: duplicate, hostile, malformed, or no route.
    Drop(DropReason),
    /// The sending session must be torn down with the given bye code (spec
    /// §4.6 step 2: a hops/TTL policy violation is not merely dropped, the
    /// session is byed).
    TerminateWithBye(PeerId, ByeCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    InvalidSize,
    HopsTtlViolation,
    Duplicate,
    NoRoute,
    HostileOrigin,
    LeafEmittedNonZeroHops,
    UdpNeverForwarded,
}

/// Runs the dispatch pipeline for one inbound message from `from` (spec
/// §4.6 steps 1-4): size validation, hops/TTL policy, routing-table
/// consultation, and the forward/broadcast/drop decision.
pub struct Dispatcher<'a> {
    manager: &'a mut PeerManager,
}

impl<'a> Dispatcher<'a> {
    pub fn new(manager: &'a mut PeerManager) -> Self {
        Self { manager }
    }

    /// `is_udp` marks a message that arrived over the UDP side-channel
    /// (pings, pongs, query-hits for OOB results) rather than the TCP
    /// stream — such messages are never forwarded (spec §4.6 step 5).
    pub fn dispatch(
        &mut self,
        from: PeerId,
        message: &Message,
        is_udp: bool,
        hostile: bool,
        now_ms: i64,
    ) -> Outcome {
        // Step 1: size/flag validation (spec §4.1).
        if matches!(message.header.validate_size(), SizeValidation::Invalid) {
            self.bump_bad(from);
            return Outcome::Drop(DropReason::InvalidSize);
        }

        // Hostile-IP filtering happens pre-dispatch for everything except
        // query-hits, which are still worth recording for statistics (spec
        // §4.6 step 5).
        if hostile && message.header.function != Function::QueryHit {
            return Outcome::Drop(DropReason::HostileOrigin);
        }

        // Step 2: TTL/hops policy (spec §8 S4: violation counts bad and the
        // session is byed with code 414, not merely dropped).
        let function = message.header.function;
        if function.requires_hop_zero_ttl_one()
            && !(message.header.hops == 0 && message.header.ttl <= 1)
        {
            self.bump_bad(from);
            return Outcome::TerminateWithBye(from, ByeCode::HopsTtlViolation);
        }
        if self.is_leaf_sender(from) && message.header.hops != 0 {
            self.bump_weird(from);
            return Outcome::Drop(DropReason::LeafEmittedNonZeroHops);
        }

        // Step 3: functions that skip routing-table consultation.
        let outcome = if function.dispatches_without_routing() {
            Outcome::Local
        } else {
            // Step 4: routing-table-consulting functions (query, query-hit, push).
            match function {
                Function::Query => self.dispatch_query(from, message, now_ms),
                Function::QueryHit | Function::Push => self.dispatch_reply(from, message, now_ms),
                _ => Outcome::Local,
            }
        };

        // Step 5: a UDP datagram is processed identically to its TCP
        // counterpart but is never physically forwarded — any would-be
        // Forward/Broadcast becomes a local no-op instead (spec §4.6 step 5).
        if is_udp {
            match outcome {
                Outcome::Forward(_) | Outcome::Broadcast => Outcome::Local,
                other => other,
            }
        } else {
            outcome
        }
    }

    fn dispatch_query(&mut self, from: PeerId, message: &Message, now_ms: i64) -> Outcome {
        let is_new = self.manager.routing.record(
            message.header.message_id,
            Function::Query,
            from,
            message.header.ttl,
            now_ms,
        );
        if !is_new {
            self.bump_duplicate(from);
            trace!(?from, message_id = ?message.header.message_id, "query duplicate, dropping");
            return Outcome::Drop(DropReason::Duplicate);
        }
        trace!(?from, message_id = ?message.header.message_id, "query recorded, broadcasting");

        // Dynamic querying (spec §4.6: a query arriving at an ultra from one
        // of its own leaves is re-issued to the mesh instead of blindly
        // broadcast, without decrementing that leaf's original TTL so
        // replies can still flow back) and the plain mesh-flood case both
        // resolve to `Broadcast` at this layer; a host's query-issuing
        // subsystem is what actually tells the two apart when it sees which
        // session `from` belongs to.
        Outcome::Broadcast
    }

    // Query-hits are allowed to fan out to multiple origins inside the TTL
    // window (several leaves may issue the same query), so unlike queries,
    // duplicate query-hits are not rejected here — only routed or dropped
    // for lack of a route.
    //
    // Routing entries are always recorded under `Function::Query` (the
    // query that caused them), regardless of which reply function is
    // looking them up — a query-hit and a push both route back along the
    // query's recorded path, so the lookup key must be `Function::Query`,
    // never the reply's own function.
    fn dispatch_reply(&mut self, from: PeerId, message: &Message, _now_ms: i64) -> Outcome {
        match self
            .manager
            .routing
            .lookup(&message.header.message_id, Function::Query)
        {
            Some(entry) => {
                trace!(?from, to = ?entry.origin, message_id = ?message.header.message_id, "reply routed");
                Outcome::Forward(entry.origin)
            }
            None => {
                self.bump_duplicate(from);
                trace!(?from, message_id = ?message.header.message_id, "reply has no route, dropping");
                Outcome::Drop(DropReason::NoRoute)
            }
        }
    }

    fn is_leaf_sender(&self, from: PeerId) -> bool {
        self.manager
            .session(from)
            .map(|s| s.mode == PeerMode::Leaf)
            .unwrap_or(false)
    }

    fn bump_bad(&mut self, from: PeerId) {
        if let Some(s) = self.manager.session_mut(from) {
            s.counters.bad += 1;
        }
    }

    fn bump_weird(&mut self, from: PeerId) {
        if let Some(s) = self.manager.session_mut(from) {
            s.counters.weird += 1;
        }
    }

    fn bump_duplicate(&mut self, from: PeerId) {
        if let Some(s) = self.manager.session_mut(from) {
            s.counters.duplicates += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServentConfig;
    use crate::peer_session::PeerSession;
    use gnutella_proto::header::Header;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6346)
    }

    fn mid(b: u8) -> [u8; 16] {
        [b; 16]
    }

    fn msg(function: Function, ttl: u8, hops: u8, id: u8) -> Message {
        Message {
            header: Header {
                message_id: mid(id),
                function,
                ttl,
                hops,
                size: 0,
                flags: None,
            },
            payload: Vec::new(),
        }
    }

    fn manager_with_leaf() -> (PeerManager, PeerId) {
        let mut m = PeerManager::new(ServentConfig::default(), SelfMode::Ultra);
        let mut s = PeerSession::new_incoming(m.alloc_id(), addr());
        s.mode = PeerMode::Leaf;
        let id = s.id;
        m.insert(s);
        (m, id)
    }

    #[test]
    fn ping_with_ttl_and_hops_violation_is_byed_and_counted_bad() {
        let (mut m, leaf) = manager_with_leaf();
        let message = msg(Function::Ping, 2, 0, 1);
        let mut d = Dispatcher::new(&mut m);
        let outcome = d.dispatch(leaf, &message, false, false, 0);
        assert_eq!(
            outcome,
            Outcome::TerminateWithBye(leaf, crate::bye::ByeCode::HopsTtlViolation)
        );
        assert_eq!(m.session(leaf).unwrap().counters.bad, 1);
    }

    /// Spec §8 S4 literal fixture: a connected leaf sends a ping with
    /// hops=1 (any TTL) — session-bad +1, bye code 414.
    #[test]
    fn s4_leaf_ping_hops_one_is_byed_with_414() {
        let (mut m, leaf) = manager_with_leaf();
        let message = msg(Function::Ping, 1, 1, 9);
        let mut d = Dispatcher::new(&mut m);
        let outcome = d.dispatch(leaf, &message, false, false, 0);
        match outcome {
            Outcome::TerminateWithBye(id, code) => {
                assert_eq!(id, leaf);
                assert_eq!(code.code(), 414);
            }
            other => panic!("expected TerminateWithBye, got {other:?}"),
        }
        assert_eq!(m.session(leaf).unwrap().counters.bad, 1);
    }

    #[test]
    fn valid_ping_dispatches_locally() {
        let (mut m, leaf) = manager_with_leaf();
        let message = msg(Function::Ping, 1, 0, 2);
        let mut d = Dispatcher::new(&mut m);
        assert_eq!(d.dispatch(leaf, &message, false, false, 0), Outcome::Local);
    }

    #[test]
    fn leaf_emitting_nonzero_hops_counts_weird_and_drops() {
        let (mut m, leaf) = manager_with_leaf();
        let message = msg(Function::Query, 4, 1, 3);
        let mut d = Dispatcher::new(&mut m);
        let outcome = d.dispatch(leaf, &message, false, false, 0);
        assert_eq!(outcome, Outcome::Drop(DropReason::LeafEmittedNonZeroHops));
        assert_eq!(m.session(leaf).unwrap().counters.weird, 1);
    }

    #[test]
    fn query_hit_with_no_route_is_dropped() {
        let (mut m, leaf) = manager_with_leaf();
        let message = msg(Function::QueryHit, 4, 1, 5);
        let mut d = Dispatcher::new(&mut m);
        assert_eq!(d.dispatch(leaf, &message, false, false, 0), Outcome::Drop(DropReason::NoRoute));
    }

    #[test]
    fn query_hit_follows_the_recorded_route() {
        let (mut m, leaf) = manager_with_leaf();
        m.routing.record(mid(6), Function::Query, leaf, 4, 0);
        let message = msg(Function::QueryHit, 4, 1, 6);
        let mut d = Dispatcher::new(&mut m);
        assert_eq!(d.dispatch(leaf, &message, false, false, 0), Outcome::Forward(leaf));
    }

    #[test]
    fn duplicate_query_from_same_origin_is_dropped() {
        let (mut m, leaf) = manager_with_leaf();
        let message = msg(Function::Query, 4, 0, 7);
        let mut d = Dispatcher::new(&mut m);
        assert_eq!(d.dispatch(leaf, &message, false, false, 0), Outcome::Broadcast);
        let mut d = Dispatcher::new(&mut m);
        assert_eq!(d.dispatch(leaf, &message, false, false, 0), Outcome::Drop(DropReason::Duplicate));
    }

    #[test]
    fn invalid_size_is_dropped_and_counted_bad() {
        let (mut m, leaf) = manager_with_leaf();
        let mut message = msg(Function::Query, 4, 0, 8);
        message.header.size = gnutella_proto::constants::MAX_PAYLOAD_SIZE as u32 + 1;
        let mut d = Dispatcher::new(&mut m);
        assert_eq!(d.dispatch(leaf, &message, false, false, 0), Outcome::Drop(DropReason::InvalidSize));
        assert_eq!(m.session(leaf).unwrap().counters.bad, 1);
    }
}
