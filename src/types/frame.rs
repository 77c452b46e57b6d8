//! Raw frame and reception timestamp types

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One fixed-size payload as handed over by a link.
///
/// This is the fundamental data unit that flows from the transport into the
/// codec. The payload is shared (zero-copy via Arc) so a frame can be kept
/// for diagnostics after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Payload bytes exactly as received
    pub data: Arc<[u8]>,

    /// Stamp assigned by the receiver when the link delivered the payload
    pub received_at: ReceptionTime,
}

impl RawFrame {
    /// Create a new raw frame
    pub fn new(data: impl Into<Arc<[u8]>>, received_at: ReceptionTime) -> Self {
        Self { data: data.into(), received_at }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reception timestamp on a monotonic wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReceptionTime {
    /// Wall-clock time derived from the clock's epoch plus monotonic elapsed time
    pub wall: DateTime<Utc>,

    /// Elapsed time since the clock epoch
    pub elapsed: Duration,
}

impl ReceptionTime {
    /// Seconds since the Unix epoch, with microsecond resolution
    pub fn epoch_seconds(&self) -> f64 {
        self.wall.timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Assigns [`ReceptionTime`] stamps that never go backwards.
///
/// The wall clock is read once at construction; every later stamp is that
/// instant plus monotonic elapsed time, so an NTP step during a session
/// cannot reorder rows.
#[derive(Debug, Clone, Copy)]
pub struct ReceptionClock {
    epoch_wall: DateTime<Utc>,
    epoch: Instant,
}

impl Default for ReceptionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceptionClock {
    /// Pin a new clock to the current wall time.
    pub fn new() -> Self {
        Self { epoch_wall: Utc::now(), epoch: Instant::now() }
    }

    /// Pin a clock to an explicit wall time (used by replays and tests).
    pub fn starting_at(epoch_wall: DateTime<Utc>) -> Self {
        Self { epoch_wall, epoch: Instant::now() }
    }

    /// Stamp the current instant.
    pub fn now(&self) -> ReceptionTime {
        let elapsed = self.epoch.elapsed();
        self.at(elapsed)
    }

    /// Stamp an explicit elapsed offset from the epoch.
    pub fn at(&self, elapsed: Duration) -> ReceptionTime {
        let offset = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::MAX);
        let wall = self.epoch_wall.checked_add_signed(offset).unwrap_or(self.epoch_wall);
        ReceptionTime { wall, elapsed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_monotonic() {
        let clock = ReceptionClock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn explicit_offsets_add_to_epoch() {
        let epoch = DateTime::from_timestamp(1_700_000_000, 0).expect("valid epoch");
        let clock = ReceptionClock::starting_at(epoch);
        let stamp = clock.at(Duration::from_millis(1500));
        assert_eq!(stamp.epoch_seconds(), 1_700_000_001.5);
        assert_eq!(stamp.elapsed, Duration::from_millis(1500));
    }

    #[test]
    fn frame_reports_length() {
        let clock = ReceptionClock::new();
        let frame = RawFrame::new(vec![1u8, 2, 3], clock.now());
        assert_eq!(frame.len(), 3);
        assert!(!frame.is_empty());
    }
}
