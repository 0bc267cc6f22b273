//! Tunable thresholds for the message queue, peer manager and timers.
//!
//! Grouped into one `serde`-derived struct built once and handed to the
//! peer manager (SPEC_FULL.md §3); no live reload, no file watching — that
//! is the job of an external collaborator per spec §1.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqConfig {
    /// Enter warn-zone when queued bytes reach this watermark.
    pub lowat: usize,
    /// Enter flow-control when queued bytes reach this watermark.
    pub hiwat: usize,
    /// Hard cap; exceeding it with a non-droppable message that can't be
    /// made room for kills the session.
    pub maxsize: usize,
    /// Grace delay before flow-control escalates to swift mode.
    pub swift_grace: Duration,
    /// Period between swift-mode target recomputations.
    pub swift_checkpoint: Duration,
    /// Tombstones are compacted out of `qlink` once they exceed this
    /// multiple of live entries (spec §4.3: "compacted when tombstones
    /// exceed 3x live count").
    pub tombstone_compaction_ratio: usize,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            lowat: 5_000,
            hiwat: 9_000,
            maxsize: 10_000,
            swift_grace: Duration::from_secs(20),
            swift_checkpoint: Duration::from_secs(1),
            tombstone_compaction_ratio: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub max_leaves: usize,
    pub max_ultrapeers: usize,
    pub max_connections: usize,
    pub max_normal: usize,
    /// Any one vendor family may not hold more than this fraction of slots
    /// of its kind (spec §4.5 "Anti-monopoly").
    pub anti_monopoly_fraction: f32,
    /// Fraction of slots reserved for a known-good vendor family.
    pub reserved_slot_fraction: f32,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            max_leaves: 30,
            max_ultrapeers: 5,
            max_connections: 50,
            max_normal: 5,
            anti_monopoly_fraction: 0.5,
            reserved_slot_fraction: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Per-second sweep period (spec §4.5).
    pub sweep_period: Duration,
    /// Minute-scale peermode evaluation period.
    pub peermode_period: Duration,
    pub handshake_timeout: Duration,
    pub activity_timeout: Duration,
    pub shutdown_grace: Duration,
    pub bye_grace: Duration,
    /// Ceiling on sustained RX flow-control ratio before a leaf is byed.
    pub leaf_rx_flowc_ceiling: f32,
    /// Ceiling on sustained RX flow-control ratio before an ultra is byed.
    pub ultra_rx_flowc_ceiling: f32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            sweep_period: Duration::from_secs(1),
            peermode_period: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
            activity_timeout: Duration::from_secs(180),
            shutdown_grace: Duration::from_secs(10),
            bye_grace: Duration::from_secs(5),
            leaf_rx_flowc_ceiling: 0.95,
            ultra_rx_flowc_ceiling: 0.90,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServentConfig {
    pub mq: MqConfig,
    pub slots: SlotConfig,
    pub timers: TimerConfig,
    /// Refuse non-inflating remotes once this many compressed peers are
    /// already connected (spec §4.5 "Prefer-compressed").
    pub prefer_compressed_above: usize,
}
