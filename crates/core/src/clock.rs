//! Process-wide Lamport clock
//!
//! Used when the local device invents a version on its own, e.g. when a
//! scan discovers that a file has disappeared and a tombstone must be
//! stamped. The clock is an explicit value threaded through constructors;
//! a test harness can create as many independent instances as it likes.

use std::sync::Mutex;

/// A monotonic logical clock yielding unique timestamps.
#[derive(Debug, Default)]
pub struct Clock {
    current: Mutex<i64>,
}

impl Clock {
    /// Create a clock starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the smallest value strictly greater than `min_above` and
    /// than any value previously returned by this instance.
    pub fn tick(&self, min_above: i64) -> i64 {
        let mut cur = self.current.lock().expect("clock mutex poisoned");
        *cur = (*cur).max(min_above) + 1;
        *cur
    }
}
