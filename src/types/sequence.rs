//! Sequence-number loss accounting

/// Compare sequence counters in u32 space with wraparound using half-range rule.
/// Returns true if `a` is considered newer than `b`.
pub fn seq_after_u32(a: u32, b: u32) -> bool {
    if a == b {
        return false;
    }
    a.wrapping_sub(b) < 0x8000_0000
}

/// What the tracker concluded about one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStep {
    /// First number seen since (re)start
    First,
    /// Exactly the next number
    InOrder,
    /// Newer than expected; `missed` numbers were skipped
    Gap { missed: u32 },
    /// Older than or equal to the last number seen
    Stale,
}

/// Reception window totals, in the same terms as the firmware's
/// `[BLE RX] pct% (rx=, miss=, exp=)` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LossSummary {
    pub received: u64,
    pub missed: u64,
    pub stale: u64,
}

impl LossSummary {
    /// Frames the producer sent in the window.
    pub fn expected(&self) -> u64 {
        self.received + self.missed
    }

    /// Received share of expected frames, in percent.
    pub fn percent(&self) -> f64 {
        match self.expected() {
            0 => 100.0,
            exp => self.received as f64 * 100.0 / exp as f64,
        }
    }
}

/// Tracks producer sequence numbers to detect loss and reordering.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
    window: LossSummary,
    total: LossSummary,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the last number (after a reconnect the producer may restart).
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Account for one received sequence number.
    pub fn observe(&mut self, seq: u32) -> SequenceStep {
        let step = match self.last {
            None => SequenceStep::First,
            Some(last) if !seq_after_u32(seq, last) => SequenceStep::Stale,
            Some(last) => match seq.wrapping_sub(last) {
                1 => SequenceStep::InOrder,
                delta => SequenceStep::Gap { missed: delta - 1 },
            },
        };

        match step {
            SequenceStep::Stale => {
                self.window.stale += 1;
                self.total.stale += 1;
            }
            SequenceStep::Gap { missed } => {
                self.window.missed += u64::from(missed);
                self.total.missed += u64::from(missed);
                self.last = Some(seq);
            }
            SequenceStep::First | SequenceStep::InOrder => self.last = Some(seq),
        }
        self.window.received += 1;
        self.total.received += 1;
        step
    }

    /// Totals since the window was last taken; starts a new window.
    pub fn take_window(&mut self) -> LossSummary {
        std::mem::take(&mut self.window)
    }

    /// Totals since construction.
    pub fn total(&self) -> LossSummary {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraparound_ordering() {
        assert!(seq_after_u32(1, 0));
        assert!(seq_after_u32(0, u32::MAX));
        assert!(!seq_after_u32(u32::MAX, 0));
        assert!(!seq_after_u32(7, 7));
    }

    #[test]
    fn counts_gaps_and_stale_frames() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(10), SequenceStep::First);
        assert_eq!(tracker.observe(11), SequenceStep::InOrder);
        assert_eq!(tracker.observe(14), SequenceStep::Gap { missed: 2 });
        assert_eq!(tracker.observe(12), SequenceStep::Stale);
        assert_eq!(tracker.observe(15), SequenceStep::InOrder);

        let window = tracker.take_window();
        assert_eq!(window.received, 5);
        assert_eq!(window.missed, 2);
        assert_eq!(window.stale, 1);
        assert_eq!(window.expected(), 7);
        assert_eq!(tracker.take_window(), LossSummary::default());
        assert_eq!(tracker.total().received, 5);
    }

    #[test]
    fn gap_across_wraparound() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(u32::MAX - 1);
        assert_eq!(tracker.observe(1), SequenceStep::Gap { missed: 2 });
    }

    #[test]
    fn percent_of_empty_window_is_full() {
        assert_eq!(LossSummary::default().percent(), 100.0);
        let summary = LossSummary { received: 99, missed: 1, stale: 0 };
        assert_eq!(summary.percent(), 99.0);
    }
}
