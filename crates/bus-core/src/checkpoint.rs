use std::time::{Duration, Instant};

/// Counts and times since the last commit; signals when a partition
/// processor should checkpoint.
///
/// Fires iff `count` messages OR `duration` time have elapsed since the last
/// reset, whichever comes first. Firing resets both counters. Pure and
/// synchronous — no I/O, so it's unit-testable without a clock mock beyond
/// `Instant`.
#[derive(Debug, Clone)]
pub struct CheckpointTrigger {
    count_threshold: u32,
    duration_threshold: Duration,
    running_count: u32,
    last_reset: Instant,
}

impl CheckpointTrigger {
    pub const DEFAULT_COUNT: u32 = 10;
    pub const DEFAULT_DURATION: Duration = Duration::from_secs(5);

    pub fn new(count_threshold: u32, duration_threshold: Duration) -> Self {
        Self {
            count_threshold,
            duration_threshold,
            running_count: 0,
            last_reset: Instant::now(),
        }
    }

    /// Record one processed message. Returns `true` iff the trigger fires,
    /// in which case it has already reset.
    pub fn increment(&mut self) -> bool {
        self.running_count += 1;
        if self.running_count >= self.count_threshold || self.last_reset.elapsed() >= self.duration_threshold {
            self.reset();
            true
        } else {
            false
        }
    }

    /// Idempotent: resetting an already-fresh trigger is a no-op beyond
    /// refreshing the clock.
    pub fn reset(&mut self) {
        self.running_count = 0;
        self.last_reset = Instant::now();
    }
}

impl Default for CheckpointTrigger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_COUNT, Self::DEFAULT_DURATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_on_count() {
        let mut trigger = CheckpointTrigger::new(3, Duration::from_secs(600));
        assert!(!trigger.increment());
        assert!(!trigger.increment());
        assert!(trigger.increment());
    }

    #[test]
    fn reset_is_idempotent() {
        let mut trigger = CheckpointTrigger::new(3, Duration::from_secs(600));
        trigger.reset();
        trigger.reset();
        assert!(!trigger.increment());
    }

    #[test]
    fn fires_on_duration() {
        let mut trigger = CheckpointTrigger::new(1_000_000, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(trigger.increment());
    }

    #[test]
    fn firing_resets_both_counters() {
        let mut trigger = CheckpointTrigger::new(2, Duration::from_secs(600));
        assert!(!trigger.increment());
        assert!(trigger.increment());
        // running_count was reset to 0 by the fire above
        assert!(!trigger.increment());
    }
}
