use std::collections::{BTreeMap, HashMap};

/// Tracks in-flight ingest offsets per partition and yields the offset that
/// is safe to commit.
///
/// Forwarders finish out of order; a partition's commit position only moves
/// past offsets that are complete and contiguous from the oldest tracked one.
#[derive(Debug, Default)]
pub struct AckTracker {
    partitions: HashMap<i32, BTreeMap<i64, bool>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .insert(offset, false);
    }

    /// Marks `offset` done. Returns the next offset to commit when the
    /// watermark moved.
    pub fn complete(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let pending = self.partitions.get_mut(&partition)?;
        *pending.get_mut(&offset)? = true;

        let mut next = None;
        while let Some(entry) = pending.first_entry() {
            if !*entry.get() {
                break;
            }
            let (done, _) = entry.remove_entry();
            next = Some(done + 1);
        }
        next
    }

    pub fn in_flight(&self) -> usize {
        self.partitions
            .values()
            .map(|p| p.values().filter(|done| !**done).count())
            .sum()
    }

    pub fn is_idle(&self) -> bool {
        self.partitions.values().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_completion_waits_for_gap() {
        let mut tracker = AckTracker::new();
        for offset in 10..14 {
            tracker.track(0, offset);
        }

        assert_eq!(tracker.complete(0, 12), None);
        assert_eq!(tracker.complete(0, 11), None);
        assert_eq!(tracker.in_flight(), 2);
        assert_eq!(tracker.complete(0, 10), Some(13));
        assert_eq!(tracker.complete(0, 13), Some(14));
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut tracker = AckTracker::new();
        tracker.track(0, 5);
        tracker.track(1, 7);
        assert_eq!(tracker.complete(1, 7), Some(8));
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.complete(2, 0), None);
        assert_eq!(tracker.complete(0, 5), Some(6));
    }
}
