//! Clock abstraction so the session engine's periodic timers (§4.5) and the
//! MQ's swift-mode grace timer can be driven deterministically in tests.

use std::sync::RwLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Anything that can report "now", in both a monotonic and a wall-clock form.
pub trait Clock: Send + Sync {
    fn now_instant(&self) -> Instant;
    fn now_unix_ms(&self) -> i64;
}

/// The default clock, backed by the OS.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_unix_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A manually advanced clock for deterministic tests of the periodic timers
/// and swift-mode grace window.
#[derive(Debug)]
pub struct ManualClock {
    instant: RwLock<Instant>,
    unix_ms: RwLock<i64>,
}

impl ManualClock {
    pub fn new(instant: Instant, unix_ms: i64) -> Self {
        Self {
            instant: RwLock::new(instant),
            unix_ms: RwLock::new(unix_ms),
        }
    }

    pub fn advance(&self, millis: u64) {
        *self.instant.write().unwrap() += std::time::Duration::from_millis(millis);
        *self.unix_ms.write().unwrap() += millis as i64;
    }
}

impl Clock for ManualClock {
    fn now_instant(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn now_unix_ms(&self) -> i64 {
        *self.unix_ms.read().unwrap()
    }
}
