//! The peer session state machine (spec §3, §4.4): one remote servent, from
//! TCP accept/connect through the 0.6 handshake to a fully established,
//! readable/writable peer, and on to shutdown/removal.

use std::net::SocketAddr;
use std::time::Duration;

use gnutella_proto::header::MessageId;
use tracing::debug;

use crate::bitset::BitSet;
use crate::error::{Error, Result};
use crate::flat_map::FlatMap;
use crate::mq::OutboundQueue;
use crate::routing::PeerId;

/// The RX-side counterpart of the outbound message queue (spec §3's
/// session children: "RX stack, TX message queue... RX flow-control
/// monitor"). Inbound bytes aren't buffered the way outbound ones are —
/// there is no intrusive list to maintain — so this only tracks the
/// bookkeeping the RX flow-control monitor needs: how much is currently
/// waiting to be processed, and a smoothed flow-control ratio compared
/// against `TimerConfig::leaf_rx_flowc_ceiling` /
/// `ultra_rx_flowc_ceiling` by the peer manager's per-second sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxStack {
    pub messages_buffered: usize,
    pub bytes_buffered: usize,
    /// EWMA of the fraction of recent ticks spent flow-controlled.
    pub flow_control_ratio: f32,
}

impl RxStack {
    /// Called once per liveness tick with whether this peer's RX side was
    /// flow-controlled during the interval. Smooths with a 0.9/0.1 EWMA so
    /// a single noisy tick doesn't trip the ceiling.
    pub fn record_ticked(&mut self, was_flow_controlled: bool) {
        let sample = if was_flow_controlled { 1.0 } else { 0.0 };
        self.flow_control_ratio = self.flow_control_ratio * 0.9 + sample * 0.1;
    }

    pub fn exceeds_ceiling(&self, ceiling: f32) -> bool {
        self.flow_control_ratio >= ceiling
    }
}

/// Topology role (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    Unknown,
    Normal,
    Ultra,
    Leaf,
    Crawler,
    Udp,
}

/// Connection state machine status (spec §4.4's table). `connecting` is the
/// initial state for outgoing connections, `receiving_hello` for incoming;
/// `removing` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    HelloSent,
    ReceivingHello,
    WelcomeSent,
    Connected,
    Shutdown,
    Removing,
}

/// Capability attributes advertised during the handshake (spec §3).
/// Bit layout is internal to this crate; order matches the spec's listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Attribute {
    CompressionSupported = 0,
    CompressionUsed = 1,
    VendorMessages = 2,
    PongCaching = 3,
    Ultrapeer = 4,
    DynamicQuerying = 5,
    QrpVersion = 6,
    Degree = 7,
    MaxTtl = 8,
    Tls = 9,
    Hsep = 10,
    TimeSync = 11,
    PushProxyRole = 12,
    Ggep = 13,
    SizeFlag = 14,
}

/// Transient session flags (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Flag {
    Incoming = 0,
    Valid = 1,
    Readable = 2,
    Writable = 3,
    ByeSent = 4,
    Closing = 5,
    EofWait = 6,
    Crawler = 7,
    Forced = 8,
    FakeName = 9,
    Gtkg = 10,
    StaleQrp = 11,
    TsyncWait = 12,
}

/// Per-session counters (spec §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub tx_drops: u64,
    pub rx_drops: u64,
    pub duplicates: u64,
    pub bad: u64,
    pub weird: u64,
    pub hostile: u64,
    pub spam: u64,
    pub evil: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
}

/// Timestamps tracked on a session (spec §3), all in milliseconds since the
/// Unix epoch per the crate's [`gnutella_proto::Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Timestamps {
    pub connect_time_ms: Option<i64>,
    pub last_tx_ms: Option<i64>,
    pub last_rx_ms: Option<i64>,
    pub last_update_ms: Option<i64>,
    pub shutdown_time_ms: Option<i64>,
    pub tx_flow_control_entry_ms: Option<i64>,
    pub leaf_flow_control_start_ms: Option<i64>,
}

/// One remote servent (spec §3 "Peer Session").
pub struct PeerSession {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Overlay listen address advertised in the handshake, if known.
    pub advertised_addr: Option<SocketAddr>,
    pub mode: PeerMode,
    pub status: Status,
    /// Vendor string from the handshake (e.g. `"LIME/5.2"`), used by the
    /// peer manager's anti-monopoly check (spec §4.5).
    pub vendor: Option<String>,
    attributes: BitSet<1>,
    flags: BitSet<1>,
    pub counters: Counters,
    pub timestamps: Timestamps,

    /// Present only once `status == Connected` (spec invariant: "a session
    /// in connected status has non-null RX and TX stacks"), installed
    /// together with `rx` in `on_final_ack_parsed`.
    pub mq: Option<OutboundQueue>,
    /// RX-side counterpart of `mq`, installed at the same time (spec §3
    /// "non-null RX and TX stacks").
    pub rx: Option<RxStack>,
    /// QRP patches we've sent to this peer, keyed by table sequence number,
    /// recording the slot count advertised in each patch (spec §3 "sent...
    /// QRP tables").
    qrp_sent: FlatMap<u8, u16>,
    /// QRP patches received from this peer, keyed by table sequence number,
    /// recording the byte length applied so far (spec §3 "received QRP
    /// tables").
    qrp_received: FlatMap<u8, u32>,
    /// Message ids of our own alive pings awaiting a pong, used by the
    /// liveness timer (spec §4.5 "alive ping").
    pub outstanding_pings: Vec<MessageId>,

    pub remove_reason: Option<String>,
}

impl PeerSession {
    pub fn new_outgoing(id: PeerId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            advertised_addr: None,
            mode: PeerMode::Unknown,
            status: Status::Connecting,
            vendor: None,
            attributes: BitSet::new(),
            flags: BitSet::new(),
            counters: Counters::default(),
            timestamps: Timestamps::default(),
            mq: None,
            rx: None,
            qrp_sent: FlatMap::new(),
            qrp_received: FlatMap::new(),
            outstanding_pings: Vec::new(),
            remove_reason: None,
        }
    }

    pub fn new_incoming(id: PeerId, addr: SocketAddr) -> Self {
        let mut s = Self::new_outgoing(id, addr);
        s.status = Status::ReceivingHello;
        s.set_flag(Flag::Incoming, true);
        s
    }

    pub fn set_attribute(&mut self, attr: Attribute, value: bool) {
        if value {
            self.attributes.set(attr as usize);
        } else {
            self.attributes.unset(attr as usize);
        }
    }

    pub fn has_attribute(&self, attr: Attribute) -> bool {
        self.attributes.get(attr as usize)
    }

    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        if value {
            self.flags.set(flag as usize);
        } else {
            self.flags.unset(flag as usize);
        }
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.get(flag as usize)
    }

    // --- state machine transitions (spec §4.4) ---

    pub fn on_tcp_established(&mut self) -> Result<()> {
        self.require(Status::Connecting)?;
        self.status = Status::HelloSent;
        Ok(())
    }

    pub fn on_hello_reply_parsed(&mut self) -> Result<()> {
        self.require(Status::HelloSent)?;
        self.status = Status::WelcomeSent;
        Ok(())
    }

    pub fn on_incoming_headers_parsed(&mut self) -> Result<()> {
        self.require(Status::ReceivingHello)?;
        self.status = Status::WelcomeSent;
        Ok(())
    }

    /// Final ACK parsed: install the RX/TX stacks and enter `connected`
    /// (spec §4.4 "install RX/TX").
    pub fn on_final_ack_parsed(&mut self, mq: OutboundQueue, now_ms: i64) -> Result<()> {
        self.require(Status::WelcomeSent)?;
        self.status = Status::Connected;
        self.mq = Some(mq);
        self.rx = Some(RxStack::default());
        self.set_flag(Flag::Valid, true);
        self.set_flag(Flag::Readable, true);
        self.set_flag(Flag::Writable, true);
        self.timestamps.connect_time_ms = Some(now_ms);
        debug!(peer_id = self.id, addr = %self.addr, "session connected");
        Ok(())
    }

    /// Record a QRP patch we sent to this peer (spec §3 "sent... QRP
    /// tables"): `seq` is the patch's sequence number within the table,
    /// `advertised_slots` the slot count it covers.
    pub fn record_qrp_sent(&mut self, seq: u8, advertised_slots: u16) {
        self.qrp_sent.insert(seq, advertised_slots);
    }

    /// Record a QRP patch received from this peer (spec §3 "received...
    /// QRP tables"): `seq` is the patch's sequence number, `applied_bytes`
    /// the cumulative byte length applied so far for that patch.
    pub fn record_qrp_received(&mut self, seq: u8, applied_bytes: u32) {
        let entry = self.qrp_received.entry(seq).or_insert(0);
        *entry += applied_bytes;
    }

    pub fn qrp_sent_patch(&self, seq: u8) -> Option<u16> {
        self.qrp_sent.get(&seq).copied()
    }

    pub fn qrp_received_bytes(&self, seq: u8) -> Option<u32> {
        self.qrp_received.get(&seq).copied()
    }

    /// Any handshake-phase error tears the session down (spec §4.4: "* |
    /// handshake error | removing").
    pub fn on_handshake_error(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(peer_id = self.id, addr = %self.addr, %reason, "handshake error");
        self.status = Status::Removing;
        self.remove_reason = Some(reason);
    }

    /// Bye sent or received while connected (spec §4.4): drain TX, enter
    /// shutdown.
    pub fn on_bye(&mut self, now_ms: i64, reason: impl Into<String>) -> Result<()> {
        self.require(Status::Connected)?;
        let reason = reason.into();
        debug!(peer_id = self.id, addr = %self.addr, %reason, "session bye, entering shutdown");
        self.status = Status::Shutdown;
        self.timestamps.shutdown_time_ms = Some(now_ms);
        self.remove_reason = Some(reason);
        if let Some(mq) = &mut self.mq {
            mq.clear();
            mq.shutdown();
        }
        Ok(())
    }

    /// EOF or read error while connected: immediate removal, marked bad if
    /// the session had reached `connected` (spec §4.4).
    pub fn on_eof_or_read_error(&mut self, reason: impl Into<String>) {
        if self.status == Status::Connected {
            self.counters.bad += 1;
        }
        self.status = Status::Removing;
        self.remove_reason = Some(reason.into());
    }

    /// TX fully drained while in shutdown: move to removing after a short
    /// delay — callers check this once the MQ reports empty.
    pub fn on_tx_drained_in_shutdown(&mut self) -> Result<()> {
        self.require(Status::Shutdown)?;
        self.status = Status::Removing;
        Ok(())
    }

    /// Shutdown grace timer expired: hard close regardless of drain state.
    pub fn on_shutdown_grace_expired(&mut self) -> Result<()> {
        self.require(Status::Shutdown)?;
        self.status = Status::Removing;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.status == Status::Connected
    }

    pub fn is_terminal(&self) -> bool {
        self.status == Status::Removing
    }

    fn require(&self, expected: Status) -> Result<()> {
        if self.status != expected {
            return Err(Error::internal(format!(
                "session {} expected status {expected:?}, found {:?}",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

/// Alive-ping cadence chosen by peermode at connection time (spec §4.4:
/// "chooses alive-ping cadence by peermode").
pub fn alive_ping_interval(mode: PeerMode) -> Duration {
    match mode {
        PeerMode::Ultra => Duration::from_secs(30),
        PeerMode::Leaf => Duration::from_secs(90),
        _ => Duration::from_secs(60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6346)
    }

    #[test]
    fn outgoing_handshake_happy_path() {
        let mut s = PeerSession::new_outgoing(1, addr());
        assert_eq!(s.status, Status::Connecting);
        s.on_tcp_established().unwrap();
        assert_eq!(s.status, Status::HelloSent);
        s.on_hello_reply_parsed().unwrap();
        assert_eq!(s.status, Status::WelcomeSent);
        s.on_final_ack_parsed(OutboundQueue::new(crate::config::MqConfig::default(), 0), 0)
            .unwrap();
        assert_eq!(s.status, Status::Connected);
        assert!(s.mq.is_some());
        assert!(s.rx.is_some());
    }

    #[test]
    fn qrp_patch_bookkeeping_accumulates_received_bytes() {
        let mut s = PeerSession::new_outgoing(6, addr());
        s.record_qrp_sent(0, 65536);
        assert_eq!(s.qrp_sent_patch(0), Some(65536));
        assert_eq!(s.qrp_sent_patch(1), None);

        s.record_qrp_received(0, 4096);
        s.record_qrp_received(0, 2048);
        assert_eq!(s.qrp_received_bytes(0), Some(6144));
    }

    #[test]
    fn rx_flow_control_ratio_trips_ceiling_after_sustained_pressure() {
        let mut rx = RxStack::default();
        for _ in 0..50 {
            rx.record_ticked(true);
        }
        assert!(rx.exceeds_ceiling(0.9));
        rx.record_ticked(false);
        assert!(rx.flow_control_ratio < 1.0);
    }

    #[test]
    fn incoming_handshake_happy_path() {
        let mut s = PeerSession::new_incoming(2, addr());
        assert_eq!(s.status, Status::ReceivingHello);
        s.on_incoming_headers_parsed().unwrap();
        assert_eq!(s.status, Status::WelcomeSent);
    }

    #[test]
    fn bye_then_grace_expiry_reaches_removing() {
        let mut s = PeerSession::new_outgoing(3, addr());
        s.on_tcp_established().unwrap();
        s.on_hello_reply_parsed().unwrap();
        s.on_final_ack_parsed(OutboundQueue::new(crate::config::MqConfig::default(), 0), 0)
            .unwrap();
        s.on_bye(1_000, "shutdown").unwrap();
        assert_eq!(s.status, Status::Shutdown);
        s.on_shutdown_grace_expired().unwrap();
        assert_eq!(s.status, Status::Removing);
    }

    #[test]
    fn out_of_order_transition_is_rejected() {
        let mut s = PeerSession::new_outgoing(4, addr());
        assert!(s.on_hello_reply_parsed().is_err());
    }

    #[test]
    fn eof_while_connected_marks_bad() {
        let mut s = PeerSession::new_outgoing(5, addr());
        s.on_tcp_established().unwrap();
        s.on_hello_reply_parsed().unwrap();
        s.on_final_ack_parsed(OutboundQueue::new(crate::config::MqConfig::default(), 0), 0)
            .unwrap();
        s.on_eof_or_read_error("connection reset");
        assert_eq!(s.status, Status::Removing);
        assert_eq!(s.counters.bad, 1);
    }
}
