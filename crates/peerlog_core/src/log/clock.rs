//! Lamport clock used to order log entries.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A Lamport timestamp tagged with the writer's id.
///
/// Clocks order by `time`, then by `id`, so every peer sorts concurrent
/// entries identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clock {
    /// Writer id (hex public key of the signing key).
    pub id: String,
    /// Logical time.
    pub time: u64,
}

impl Clock {
    /// Creates a clock at `time`.
    pub fn new(id: impl Into<String>, time: u64) -> Self {
        Self {
            id: id.into(),
            time,
        }
    }

    /// Returns the clock advanced by one.
    #[must_use]
    pub fn tick(&self) -> Self {
        Self::new(self.id.clone(), self.time + 1)
    }

    /// Returns this clock moved forward to at least `other.time`.
    #[must_use]
    pub fn merge(&self, other: &Clock) -> Self {
        Self::new(self.id.clone(), self.time.max(other.time))
    }
}

impl Ord for Clock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Clock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_orders_first() {
        assert!(Clock::new("b", 1) < Clock::new("a", 2));
    }

    #[test]
    fn id_breaks_ties() {
        assert!(Clock::new("a", 3) < Clock::new("b", 3));
        assert_eq!(Clock::new("a", 3).cmp(&Clock::new("a", 3)), Ordering::Equal);
    }

    #[test]
    fn tick_and_merge() {
        let clock = Clock::new("a", 2);
        assert_eq!(clock.tick().time, 3);
        assert_eq!(clock.merge(&Clock::new("b", 7)), Clock::new("a", 7));
        assert_eq!(clock.merge(&Clock::new("b", 1)), Clock::new("a", 2));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn merge_then_tick_is_after_both(a in 0u64..1_000_000, b in 0u64..1_000_000) {
                let ours = Clock::new("a", a);
                let theirs = Clock::new("b", b);
                let next = ours.merge(&theirs).tick();

                prop_assert!(next.time > ours.time);
                prop_assert!(next.time > theirs.time);
                prop_assert_eq!(next.id, "a");
                prop_assert_eq!(ours.merge(&theirs).time, theirs.merge(&ours).time);
            }
        }
    }
}
