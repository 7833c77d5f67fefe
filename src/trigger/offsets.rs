//! Commit watermarks for concurrently processed messages

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    held: BTreeSet<i64>,
    highest_done: Option<i64>,
    committed: Option<i64>,
}

/// Tracks in-flight offsets per partition
///
/// A partition's commit position never passes an offset that is still being
/// processed, even when later offsets finish first. Held offsets pin the
/// position for the rest of the session so they are redelivered after a
/// restart or rebalance.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message as in flight
    pub fn start(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Mark a message done
    ///
    /// Returns the next offset to commit when the watermark advanced.
    pub fn finish(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.entry(partition).or_default();
        state.in_flight.remove(&offset);
        state.highest_done = Some(state.highest_done.map_or(offset, |done| done.max(offset)));

        state.advance()
    }

    /// Stop tracking a message without marking it done
    ///
    /// The commit position stays at or below `offset` from now on.
    pub fn hold(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.entry(partition).or_default();
        state.in_flight.remove(&offset);
        state.held.insert(offset);
        state.advance()
    }

    /// Messages currently in flight across all partitions
    pub fn in_flight(&self) -> usize {
        self.partitions.values().map(|p| p.in_flight.len()).sum()
    }

    /// Messages held back from commit across all partitions
    pub fn held(&self) -> usize {
        self.partitions.values().map(|p| p.held.len()).sum()
    }
}

impl PartitionOffsets {
    /// Next offset to commit, if the watermark moved past the last commit
    fn advance(&mut self) -> Option<i64> {
        let lowest_pending = self
            .in_flight
            .iter()
            .next()
            .into_iter()
            .chain(self.held.iter().next())
            .min()
            .copied();

        let watermark = match lowest_pending {
            Some(lowest) => lowest,
            None => self.highest_done? + 1,
        };

        if self.committed.map_or(true, |committed| watermark > committed) {
            self.committed = Some(watermark);
            Some(watermark)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_offsets_commit_immediately() {
        let mut tracker = OffsetTracker::new();
        tracker.start(0, 10);
        assert_eq!(tracker.finish(0, 10), Some(11));
        tracker.start(0, 11);
        assert_eq!(tracker.finish(0, 11), Some(12));
    }

    #[test]
    fn test_out_of_order_finish_holds_watermark() {
        let mut tracker = OffsetTracker::new();
        tracker.start(0, 5);
        tracker.start(0, 6);
        tracker.start(0, 7);

        // 6 and 7 finish while 5 is still running
        assert_eq!(tracker.finish(0, 7), Some(5));
        assert_eq!(tracker.finish(0, 6), None);
        assert_eq!(tracker.in_flight(), 1);

        assert_eq!(tracker.finish(0, 5), Some(8));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.start(0, 1);
        tracker.start(1, 100);

        assert_eq!(tracker.finish(1, 100), Some(101));
        assert_eq!(tracker.finish(0, 1), Some(2));
    }

    #[test]
    fn test_held_offset_pins_the_watermark() {
        let mut tracker = OffsetTracker::new();
        tracker.start(0, 20);
        tracker.start(0, 21);
        tracker.start(0, 22);

        // Committing 20 itself means it is read again
        assert_eq!(tracker.hold(0, 20), Some(20));
        assert_eq!(tracker.finish(0, 21), None);
        assert_eq!(tracker.finish(0, 22), None);

        tracker.start(0, 23);
        assert_eq!(tracker.finish(0, 23), None);
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.held(), 1);
    }

    #[test]
    fn test_hold_after_earlier_commit_keeps_last_position() {
        let mut tracker = OffsetTracker::new();
        tracker.start(0, 1);
        assert_eq!(tracker.finish(0, 1), Some(2));

        tracker.start(0, 2);
        tracker.start(0, 3);
        assert_eq!(tracker.finish(0, 3), None);
        // The position already sits at the held offset
        assert_eq!(tracker.hold(0, 2), None);
    }

    #[test]
    fn test_hold_releases_earlier_finished_offsets() {
        let mut tracker = OffsetTracker::new();
        tracker.start(0, 7);
        tracker.start(0, 8);

        // 7 finishing is committed up to the still-running 8
        assert_eq!(tracker.finish(0, 7), Some(8));
        assert_eq!(tracker.hold(0, 8), None);

        // Other partitions keep committing
        tracker.start(1, 0);
        assert_eq!(tracker.finish(1, 0), Some(1));
    }
}
