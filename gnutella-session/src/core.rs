//! The single owning value for all session/MQ/routing state (spec §5, §9's
//! redesign note: "a single `CoreState` value owned by the event loop,
//! passed explicitly" rather than module-level mutable state or
//! `Arc<Mutex<...>>`-shared session internals).
//!
//! A host (owning the actual TCP/UDP sockets and its async runtime's event
//! loop) holds one `CoreState` and calls into it as bytes arrive and timers
//! fire; nothing here spawns tasks or touches a socket directly, so the
//! same `CoreState` drives both a real runtime and a deterministic test
//! harness built on [`gnutella_proto::ManualClock`].

use gnutella_proto::header::Message;

use crate::bye::ByeCode;
use crate::config::ServentConfig;
use crate::dispatch::{Dispatcher, Outcome};
use crate::peer_manager::{PeerManager, SelfMode};
use crate::routing::PeerId;

pub struct CoreState {
    pub peers: PeerManager,
}

impl CoreState {
    pub fn new(config: ServentConfig, self_mode: SelfMode) -> Self {
        Self {
            peers: PeerManager::new(config, self_mode),
        }
    }

    /// Run one inbound message through the dispatch pipeline. The sole
    /// entry point a host needs for routing decisions; everything else
    /// (admission, timers) is driven through `self.peers` directly.
    pub fn dispatch_inbound(
        &mut self,
        from: PeerId,
        message: &Message,
        is_udp: bool,
        hostile: bool,
        now_ms: i64,
    ) -> Outcome {
        Dispatcher::new(&mut self.peers).dispatch(from, message, is_udp, hostile, now_ms)
    }

    /// Run the per-second maintenance sweep (spec §4.5): routing-table
    /// aging, activity timeouts, shutdown-grace finalization. Returns
    /// sessions the host must send a bye to (sustained RX flow control).
    pub fn tick_second(&mut self, now_ms: i64) -> Vec<(PeerId, ByeCode)> {
        self.peers.sweep_per_second(now_ms)
    }

    /// Run the minute-scale peermode evaluation (spec §4.5).
    pub fn tick_minute(
        &mut self,
        now_ms: i64,
        uptime_ms: i64,
        has_good_udp: bool,
        fd_headroom: bool,
        mem_headroom: bool,
    ) {
        self.peers
            .evaluate_peermode(now_ms, uptime_ms, has_good_udp, fd_headroom, mem_headroom);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_session::{PeerMode, PeerSession};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[test]
    fn core_state_owns_peers_and_drives_the_per_second_sweep() {
        let mut core = CoreState::new(ServentConfig::default(), SelfMode::Ultra);
        let id = core.peers.alloc_id();
        let mut s = PeerSession::new_incoming(id, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6346));
        s.mode = PeerMode::Leaf;
        core.peers.insert(s);
        core.tick_second(0);
        assert!(core.peers.session(id).is_some());
    }
}
