//! Peer manager (spec §4.5): the set of sessions, global counters, periodic
//! timers, admission control, eviction policy, and peermode evaluation.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::bye::ByeCode;
use crate::config::ServentConfig;
use crate::peer_session::{PeerMode, PeerSession, Status};
use crate::routing::{PeerId, RoutingTable};

/// Our own topology role, tracked separately from any one peer's `mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfMode {
    Ultra,
    Leaf,
}

/// Outcome of admission control for an incoming or outgoing handshake
/// (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    AcceptAsCrawler,
    RejectOnlineModeOff,
    RejectSlotsFull,
    RejectMonopoly,
    RejectUnstableVendor,
}

/// What the remote side is asking to be (advertised in `X-Ultrapeer`,
/// or the crawler header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRequest<'a> {
    pub remote_mode: PeerMode,
    pub crawler: bool,
    pub vendor: &'a str,
    pub compressed: bool,
}

pub struct PeerManager {
    pub config: ServentConfig,
    pub self_mode: SelfMode,
    sessions: HashMap<PeerId, PeerSession>,
    pub routing: RoutingTable,
    next_id: PeerId,

    ultra_count: usize,
    leaf_count: usize,
    normal_count: usize,
    compressed_count: usize,
    vendor_counts: HashMap<String, usize>,
    banned_vendors: std::collections::HashSet<String>,

    peermode_cooldown_ms: i64,
    last_peermode_flip_ms: i64,
    online_mode: bool,
}

impl PeerManager {
    pub fn new(config: ServentConfig, self_mode: SelfMode) -> Self {
        let routing_ttl = std::time::Duration::from_secs(300);
        Self {
            config,
            self_mode,
            sessions: HashMap::new(),
            routing: RoutingTable::new(routing_ttl),
            next_id: 1,
            ultra_count: 0,
            leaf_count: 0,
            normal_count: 0,
            compressed_count: 0,
            vendor_counts: HashMap::new(),
            banned_vendors: std::collections::HashSet::new(),
            peermode_cooldown_ms: 60_000,
            last_peermode_flip_ms: 0,
            online_mode: true,
        }
    }

    pub fn set_online_mode(&mut self, on: bool) {
        self.online_mode = on;
    }

    pub fn ban_vendor(&mut self, vendor: impl Into<String>) {
        self.banned_vendors.insert(vendor.into());
    }

    pub fn session(&self, id: PeerId) -> Option<&PeerSession> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: PeerId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn alloc_id(&mut self) -> PeerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, session: PeerSession) {
        if let Some(vendor) = &session.vendor {
            let key = Self::normalize_vendor(vendor).to_string();
            *self.vendor_counts.entry(key).or_insert(0) += 1;
        }
        self.sessions.insert(session.id, session);
    }

    /// Decide admission for a new peer (spec §4.5 "Admission").
    pub fn admit(&self, req: &AdmissionRequest<'_>) -> Admission {
        if !self.online_mode {
            return Admission::RejectOnlineModeOff;
        }
        if req.crawler {
            return Admission::AcceptAsCrawler;
        }
        if self.is_vendor_banned(req.vendor) {
            return Admission::RejectUnstableVendor;
        }

        match self.self_mode {
            SelfMode::Ultra => match req.remote_mode {
                PeerMode::Leaf => {
                    if self.leaf_count >= self.config.slots.max_leaves && !self.has_evictable_useless_leaf() {
                        return Admission::RejectSlotsFull;
                    }
                }
                PeerMode::Ultra => {
                    let cap = self
                        .config
                        .slots
                        .max_connections
                        .saturating_sub(self.normal_count);
                    if self.ultra_count >= cap && !self.has_evictable_useless_ultra() {
                        return Admission::RejectSlotsFull;
                    }
                }
                _ => {}
            },
            SelfMode::Leaf => {
                if req.remote_mode != PeerMode::Ultra {
                    return Admission::RejectSlotsFull;
                }
                if self.ultra_count >= self.config.slots.max_ultrapeers {
                    return Admission::RejectSlotsFull;
                }
            }
        }

        if self.prefer_compressed_violation(req) {
            return Admission::RejectSlotsFull;
        }
        if self.would_monopolize(req) {
            return Admission::RejectMonopoly;
        }

        Admission::Accept
    }

    fn is_vendor_banned(&self, vendor: &str) -> bool {
        self.banned_vendors.contains(Self::normalize_vendor(vendor))
    }

    /// Vendor prefix, normalized by stopping at the first `/`, space, or
    /// digit (spec §4.5 "Anti-monopoly": "prefix-normalized, delimited by
    /// `/` `space` or digit").
    fn normalize_vendor(vendor: &str) -> &str {
        let end = vendor
            .find(|c: char| c == '/' || c == ' ' || c.is_ascii_digit())
            .unwrap_or(vendor.len());
        &vendor[..end]
    }

    fn would_monopolize(&self, req: &AdmissionRequest<'_>) -> bool {
        let vendor = Self::normalize_vendor(req.vendor);
        let kind_total = match req.remote_mode {
            PeerMode::Ultra => self.ultra_count,
            PeerMode::Leaf => self.leaf_count,
            _ => self.normal_count,
        };
        if kind_total == 0 {
            return false;
        }
        let current = self.vendor_counts.get(vendor).copied().unwrap_or(0);
        (current + 1) as f32 / (kind_total + 1) as f32 > self.config.slots.anti_monopoly_fraction
    }

    fn prefer_compressed_violation(&self, req: &AdmissionRequest<'_>) -> bool {
        !req.compressed && self.compressed_count >= self.config.prefer_compressed_above
    }

    fn has_evictable_useless_leaf(&self) -> bool {
        self.sessions
            .values()
            .any(|s| s.mode == PeerMode::Leaf && self.is_useless_leaf(s))
    }

    fn has_evictable_useless_ultra(&self) -> bool {
        self.sessions
            .values()
            .any(|s| s.mode == PeerMode::Ultra && !s.has_attribute(crate::peer_session::Attribute::CompressionUsed))
    }

    /// A "useless" leaf: no QRT received, no files shared, or hops-flow
    /// throttled past the grace period (spec §4.5).
    fn is_useless_leaf(&self, s: &PeerSession) -> bool {
        s.has_flag(crate::peer_session::Flag::StaleQrp)
    }

    /// Eviction scoring (spec §4.5 "Eviction of worst peer"):
    /// `score = 100*weird + 10*bad + dups`. Among the highest scorers,
    /// choose one at random.
    pub fn worst_peer(&self) -> Option<PeerId> {
        let mut best_score = None;
        let mut candidates = Vec::new();
        for s in self.sessions.values() {
            let score = 100 * s.counters.weird + 10 * s.counters.bad + s.counters.duplicates;
            match best_score {
                None => {
                    best_score = Some(score);
                    candidates = vec![s.id];
                }
                Some(b) if score > b => {
                    best_score = Some(score);
                    candidates = vec![s.id];
                }
                Some(b) if score == b => candidates.push(s.id),
                _ => {}
            }
        }
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    /// Per-second sweep (spec §4.5): activity timeouts, flow-control
    /// ceilings, bye-drain finalization, and routing-table aging. Returns
    /// sessions whose sustained RX flow-control ratio exceeded the
    /// peermode-specific ceiling and must be byed by the caller (this crate
    /// doesn't own the socket write side, so it can't send the bye itself —
    /// spec §4.5: "bye if sustained ratio exceeds the peermode-specific
    /// ceiling").
    pub fn sweep_per_second(&mut self, now_ms: i64) -> Vec<(PeerId, ByeCode)> {
        self.routing.sweep(now_ms);

        let mut to_remove = Vec::new();
        let mut to_bye = Vec::new();
        for s in self.sessions.values_mut() {
            match s.status {
                Status::Shutdown => {
                    let drained = s.mq.as_ref().map(|mq| mq.count() == 0).unwrap_or(true);
                    if drained {
                        let _ = s.on_tx_drained_in_shutdown();
                    } else if let Some(start) = s.timestamps.shutdown_time_ms {
                        if now_ms - start > self.config.timers.shutdown_grace.as_millis() as i64 {
                            let _ = s.on_shutdown_grace_expired();
                        }
                    }
                }
                Status::Connected => {
                    if let Some(last_rx) = s.timestamps.last_rx_ms {
                        let quiet = now_ms - last_rx;
                        let timeout = self.config.timers.activity_timeout.as_millis() as i64;
                        if quiet > timeout {
                            s.on_eof_or_read_error("activity timeout");
                        }
                    }
                    if let Some(mq) = &mut s.mq {
                        mq.check_swift_deadline(now_ms);
                    }
                    if let Some(rx) = &s.rx {
                        let ceiling = match s.mode {
                            PeerMode::Leaf => self.config.timers.leaf_rx_flowc_ceiling,
                            _ => self.config.timers.ultra_rx_flowc_ceiling,
                        };
                        if rx.exceeds_ceiling(ceiling) {
                            warn!(peer_id = s.id, ratio = rx.flow_control_ratio, ceiling, "sustained RX flow control, byeing");
                            to_bye.push((s.id, ByeCode::NoActivity));
                        }
                    }
                }
                _ => {}
            }
            if s.is_terminal() {
                to_remove.push(s.id);
            }
        }
        for id in to_remove {
            debug!(peer_id = id, "session reached terminal state, removing");
            self.remove(id);
        }
        to_bye
    }

    /// Minute-scale peermode self-promotion/demotion (spec §4.5): flips
    /// between ultra and leaf within configurable bounds, doubling the
    /// cooldown on each flip up to a ceiling.
    pub fn evaluate_peermode(
        &mut self,
        now_ms: i64,
        uptime_ms: i64,
        has_good_udp: bool,
        fd_headroom: bool,
        mem_headroom: bool,
    ) {
        if now_ms - self.last_peermode_flip_ms < self.peermode_cooldown_ms {
            return;
        }
        let wants_ultra =
            uptime_ms > 600_000 && has_good_udp && fd_headroom && mem_headroom && self.leaf_count == 0;
        let should_flip = match self.self_mode {
            SelfMode::Leaf if wants_ultra => true,
            SelfMode::Ultra if !fd_headroom || !mem_headroom => true,
            _ => false,
        };
        if should_flip {
            self.self_mode = match self.self_mode {
                SelfMode::Leaf => SelfMode::Ultra,
                SelfMode::Ultra => SelfMode::Leaf,
            };
            self.last_peermode_flip_ms = now_ms;
            self.peermode_cooldown_ms = (self.peermode_cooldown_ms * 2).min(60 * 60_000);
        }
    }

    fn remove(&mut self, id: PeerId) {
        if let Some(s) = self.sessions.remove(&id) {
            match s.mode {
                PeerMode::Ultra => self.ultra_count = self.ultra_count.saturating_sub(1),
                PeerMode::Leaf => self.leaf_count = self.leaf_count.saturating_sub(1),
                PeerMode::Normal => self.normal_count = self.normal_count.saturating_sub(1),
                _ => {}
            }
            if s.has_attribute(crate::peer_session::Attribute::CompressionUsed) {
                self.compressed_count = self.compressed_count.saturating_sub(1);
            }
            if let Some(vendor) = &s.vendor {
                let key = Self::normalize_vendor(vendor);
                if let Some(count) = self.vendor_counts.get_mut(key) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// Called when a session reaches `connected` with a decided `mode`:
    /// increments exactly one of `ultra_count`/`leaf_count`/`normal_count`
    /// (spec §3 invariant).
    pub fn count_connected(&mut self, mode: PeerMode, compressed: bool) {
        match mode {
            PeerMode::Ultra => self.ultra_count += 1,
            PeerMode::Leaf => self.leaf_count += 1,
            PeerMode::Normal => self.normal_count += 1,
            _ => {}
        }
        if compressed {
            self.compressed_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr() -> PeerManager {
        PeerManager::new(ServentConfig::default(), SelfMode::Ultra)
    }

    #[test]
    fn online_mode_off_rejects_everyone() {
        let mut m = mgr();
        m.set_online_mode(false);
        let req = AdmissionRequest {
            remote_mode: PeerMode::Leaf,
            crawler: false,
            vendor: "LIME",
            compressed: true,
        };
        assert_eq!(m.admit(&req), Admission::RejectOnlineModeOff);
    }

    #[test]
    fn crawler_is_always_accepted() {
        let m = mgr();
        let req = AdmissionRequest {
            remote_mode: PeerMode::Unknown,
            crawler: true,
            vendor: "LIME",
            compressed: false,
        };
        assert_eq!(m.admit(&req), Admission::AcceptAsCrawler);
    }

    #[test]
    fn banned_vendor_rejected() {
        let mut m = mgr();
        m.ban_vendor("BAD");
        let req = AdmissionRequest {
            remote_mode: PeerMode::Leaf,
            crawler: false,
            vendor: "BAD/3.1",
            compressed: true,
        };
        assert_eq!(m.admit(&req), Admission::RejectUnstableVendor);
    }

    #[test]
    fn vendor_prefix_normalization_stops_at_digit_slash_or_space() {
        assert_eq!(PeerManager::normalize_vendor("LIME/5.2"), "LIME");
        assert_eq!(PeerManager::normalize_vendor("BearShare 6"), "BearShare");
        assert_eq!(PeerManager::normalize_vendor("gtk-gnutella1.0"), "gtk-gnutella");
    }

    #[test]
    fn sustained_rx_flow_control_is_byed_by_the_sweep() {
        use crate::mq::OutboundQueue;
        use std::net::{IpAddr, Ipv4Addr, SocketAddr};

        let mut m = mgr();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6346);
        let id = m.alloc_id();
        let mut s = PeerSession::new_incoming(id, addr);
        s.mode = PeerMode::Ultra;
        s.on_incoming_headers_parsed().unwrap();
        s.on_final_ack_parsed(OutboundQueue::new(crate::config::MqConfig::default(), 0), 0)
            .unwrap();
        s.rx.as_mut().unwrap().flow_control_ratio = 1.0;
        m.insert(s);

        let to_bye = m.sweep_per_second(1);
        assert_eq!(to_bye, vec![(id, ByeCode::NoActivity)]);
    }
}
