use std::collections::{BTreeSet, HashMap};

/// Tracks in-flight offsets per partition and decides when it's safe to
/// advance the committed offset, independent of whether the corresponding
/// correlated request has completed — commit advances independently of
/// correlation completion.
///
/// Dispatch order isn't guaranteed to be completion order once handlers run
/// concurrently (bounded by the per-partition semaphore in [`crate::processor`]),
/// so a message completing doesn't always mean it's safe to commit past it —
/// only when it was the *lowest* still-outstanding offset for its partition.
///
/// Each partition also carries a generation counter, bumped by
/// [`forget_partition`](Self::forget_partition) on revocation. A dispatch
/// tracked under one generation whose completion arrives after the
/// partition has been revoked and reassigned carries its original
/// generation number, so [`complete`](Self::complete) can recognize it's
/// stale and drop it instead of mutating the new assignment's frontier —
/// this is what makes it safe to let in-flight handlers finish in the
/// background rather than blocking the rebalance callback on a drain.
#[derive(Default)]
pub struct CommitController {
    in_flight: HashMap<i32, BTreeSet<i64>>,
    last_advanced: HashMap<i32, i64>,
    generations: HashMap<i32, u64>,
}

impl CommitController {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_generation(&mut self, partition: i32) -> u64 {
        *self.generations.entry(partition).or_insert(0)
    }

    /// Record that `offset` on `partition` has been dispatched to a handler.
    /// Returns the partition's current generation, to be carried alongside
    /// the dispatch and handed back to [`complete`](Self::complete).
    pub fn track(&mut self, partition: i32, offset: i64) -> u64 {
        self.in_flight.entry(partition).or_default().insert(offset);
        self.current_generation(partition)
    }

    /// Mark `offset` complete, as tracked under `generation`. Returns
    /// `Some(commit_offset)` — the next offset to resume consuming from —
    /// iff this completion advanced the partition's committable frontier
    /// (`offset` was the lowest in-flight offset for its partition, and
    /// `generation` still matches the partition's current assignment);
    /// `None` if an earlier offset is still outstanding, or if the
    /// partition was revoked and reassigned since this offset was tracked.
    pub fn complete(&mut self, partition: i32, offset: i64, generation: u64) -> Option<i64> {
        if self.current_generation(partition) != generation {
            if let Some(set) = self.in_flight.get_mut(&partition) {
                set.remove(&offset);
            }
            return None;
        }

        let set = self.in_flight.get_mut(&partition)?;
        let was_min = set.iter().next() == Some(&offset);
        set.remove(&offset);
        if !was_min {
            return None;
        }
        let commit_offset = match set.iter().next() {
            Some(&min) => min,
            None => offset + 1,
        };
        self.last_advanced.insert(partition, commit_offset);
        Some(commit_offset)
    }

    /// The most recently advanced commit offset known for `partition`, if
    /// any — used by `OnPartitionEndReached` to flush the current frontier
    /// immediately rather than waiting for the checkpoint trigger to fire.
    pub fn last_commit_offset(&self, partition: i32) -> Option<i64> {
        self.last_advanced.get(&partition).copied()
    }

    /// Forget a partition's in-flight/commit state and bump its generation,
    /// e.g. on revocation — any completion still in flight for the old
    /// generation is recognized as stale by `complete` even once the
    /// partition is reassigned to this same processor.
    pub fn forget_partition(&mut self, partition: i32) {
        self.in_flight.remove(&partition);
        self.last_advanced.remove(&partition);
        *self.generations.entry(partition).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completing_sole_in_flight_offset_commits_next() {
        let mut controller = CommitController::new();
        let gen = controller.track(0, 10);
        assert_eq!(controller.complete(0, 10, gen), Some(11));
    }

    #[test]
    fn completing_out_of_order_withholds_commit() {
        let mut controller = CommitController::new();
        let gen = controller.track(0, 10);
        controller.track(0, 11);
        controller.track(0, 12);

        // 11 finishes before 10: nothing is committable yet.
        assert_eq!(controller.complete(0, 11, gen), None);
        // 10 finally finishes: frontier jumps straight past the already-done 11.
        assert_eq!(controller.complete(0, 10, gen), Some(12));
        // 12 was the only one left; completing it commits past it.
        assert_eq!(controller.complete(0, 12, gen), Some(13));
    }

    #[test]
    fn partitions_are_tracked_independently() {
        let mut controller = CommitController::new();
        let gen0 = controller.track(0, 5);
        let gen1 = controller.track(1, 5);

        assert_eq!(controller.complete(1, 5, gen1), Some(6));
        assert_eq!(controller.complete(0, 5, gen0), Some(6));
    }

    #[test]
    fn forgetting_a_partition_drops_its_in_flight_state() {
        let mut controller = CommitController::new();
        let gen = controller.track(0, 5);
        controller.forget_partition(0);
        assert_eq!(controller.complete(0, 5, gen), None);
    }

    #[test]
    fn last_commit_offset_tracks_the_most_recent_advance() {
        let mut controller = CommitController::new();
        assert_eq!(controller.last_commit_offset(0), None);
        let gen = controller.track(0, 5);
        controller.complete(0, 5, gen);
        assert_eq!(controller.last_commit_offset(0), Some(6));
    }

    #[test]
    fn forgetting_a_partition_drops_its_last_commit_offset() {
        let mut controller = CommitController::new();
        let gen = controller.track(0, 5);
        controller.complete(0, 5, gen);
        controller.forget_partition(0);
        assert_eq!(controller.last_commit_offset(0), None);
    }

    #[test]
    fn completion_from_a_stale_generation_is_dropped_even_after_reassignment() {
        let mut controller = CommitController::new();
        let stale_gen = controller.track(0, 5);

        // Partition revoked before the handler for offset 5 finishes, then
        // reassigned and a new offset tracked under the new generation.
        controller.forget_partition(0);
        let new_gen = controller.track(0, 100);
        assert_ne!(stale_gen, new_gen);

        // The stale completion must not advance (or otherwise disturb) the
        // new assignment's frontier.
        assert_eq!(controller.complete(0, 5, stale_gen), None);
        assert_eq!(controller.complete(0, 100, new_gen), Some(101));
    }
}
