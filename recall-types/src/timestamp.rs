//! Hybrid Logical Clock timestamps for ordering local changes.
//!
//! Combines physical time with a logical counter so that:
//! - successive local mutations always get strictly increasing timestamps,
//!   even when several land in the same millisecond
//! - a local edit made after observing a remote version sorts after it
//! - the wall component stays close to physical time, so it can be compared
//!   with millisecond version markers coming from the remote store

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A Hybrid Logical Clock timestamp.
///
/// Consists of:
/// - `wall_time`: Milliseconds since Unix epoch (physical component)
/// - `logical`: Logical counter for events at the same wall time
///
/// Based on the HLC algorithm from "Logical Physical Clocks" (Kulkarni et al.).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    /// Physical time component (milliseconds since Unix epoch).
    wall_time: u64,
    /// Logical counter for ordering events at the same wall time.
    logical: u32,
}

impl HybridTimestamp {
    /// Creates a timestamp from components.
    #[must_use]
    pub const fn new(wall_time: u64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    /// Creates a timestamp at a given wall time with a zero logical counter.
    #[must_use]
    pub const fn from_millis(wall_time: u64) -> Self {
        Self::new(wall_time, 0)
    }

    /// Returns the wall time component.
    #[must_use]
    pub const fn wall_time(&self) -> u64 {
        self.wall_time
    }

    /// Returns the logical counter.
    #[must_use]
    pub const fn logical(&self) -> u32 {
        self.logical
    }

    /// Generates the next timestamp, ensuring monotonicity.
    ///
    /// This should be called when recording a new local change.
    #[must_use]
    pub fn tick(&self) -> Self {
        let now = wall_clock_millis();

        if now > self.wall_time {
            Self {
                wall_time: now,
                logical: 0,
            }
        } else {
            Self {
                wall_time: self.wall_time,
                logical: self.logical.saturating_add(1),
            }
        }
    }

    /// Updates this clock based on an observed timestamp.
    ///
    /// The result is greater than both the current clock and the observed
    /// timestamp.
    #[must_use]
    pub fn receive(&self, other: &Self) -> Self {
        let now = wall_clock_millis();

        let max_wall = now.max(self.wall_time).max(other.wall_time);

        let logical = if max_wall == self.wall_time && max_wall == other.wall_time {
            self.logical.max(other.logical).saturating_add(1)
        } else if max_wall == self.wall_time {
            self.logical.saturating_add(1)
        } else if max_wall == other.wall_time {
            other.logical.saturating_add(1)
        } else {
            0
        };

        Self {
            wall_time: max_wall,
            logical,
        }
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.wall_time.cmp(&other.wall_time) {
            Ordering::Equal => self.logical.cmp(&other.logical),
            other => other,
        }
    }
}

/// Issues timestamps for local mutations.
///
/// Shared by every collection of a device so that all local changes are
/// totally ordered. Safe to use from multiple threads.
#[derive(Debug)]
pub struct LocalClock {
    last: Mutex<HybridTimestamp>,
}

impl LocalClock {
    /// Creates a clock starting at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(HybridTimestamp::new(0, 0))
    }

    /// Creates a clock whose first issued timestamp is after `last`.
    pub fn starting_at(last: HybridTimestamp) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }

    /// Returns a timestamp strictly greater than any previously issued or
    /// observed one.
    pub fn next(&self) -> HybridTimestamp {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let next = last.tick();
        *last = next;
        next
    }

    /// Advances the clock past a version observed from the remote store.
    pub fn observe(&self, wall_time: u64) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if wall_time >= last.wall_time() {
            *last = last.receive(&HybridTimestamp::from_millis(wall_time));
        }
    }

    /// The most recently issued or observed timestamp.
    pub fn last(&self) -> HybridTimestamp {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}
