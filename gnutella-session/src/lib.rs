//! # Gnutella Session
//!
//! The servent session engine: the per-peer outbound message queue, the
//! routing table, the peer session state machine, the peer manager
//! (admission control, eviction, periodic timers) and the dispatch pipeline
//! that decides where an inbound message goes next.
//!
//! This crate has no notion of sockets or an event loop; it is driven by a
//! host that owns the actual TCP/UDP I/O and calls into these types as bytes
//! arrive and timers fire. The wire codec, compression and handshake
//! parsing it builds on live in `gnutella-proto`.

pub mod bitset;
pub mod bye;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod flat_map;
pub mod message;
pub mod mq;
pub mod peer_manager;
pub mod peer_session;
pub mod routing;

pub use bitset::BitSet;
pub use bye::ByeCode;
pub use config::{MqConfig, ServentConfig, SlotConfig, TimerConfig};
pub use core::CoreState;
pub use dispatch::{Dispatcher, DropReason, Outcome};
pub use error::{Error, Kind, Result};
pub use flat_map::FlatMap;
pub use message::{Priority, QueuedMessage};
pub use mq::{FlowState, MqEvent, OutboundQueue};
pub use peer_manager::{Admission, AdmissionRequest, PeerManager, SelfMode};
pub use peer_session::{Attribute, Counters, Flag, PeerMode, PeerSession, Status, Timestamps};
pub use routing::{PeerId, RoutingEntry, RoutingTable};
