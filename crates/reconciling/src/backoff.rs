//! # Fibonacci Backoff
//!
//! Progressive backoff that grows more slowly than exponential backoff. Used
//! for transient API retries in [`KubeObjectStore`](crate::KubeObjectStore)
//! and for rate-limited requeues in the controller work queues.
//!
//! Sequence for `new(min, max)`: min, min, 2min, 3min, 5min, 8min, ... capped at max.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two backoffs. Internally tracked in
/// milliseconds.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff in milliseconds (for reset)
    min_millis: u64,
    /// Previous backoff in milliseconds
    prev_millis: u64,
    /// Current backoff in milliseconds
    current_millis: u64,
    /// Maximum backoff in milliseconds
    max_millis: u64,
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff bounded by `min` and `max`.
    ///
    /// # Arguments
    ///
    /// * `min` - Backoff used for the first two values
    /// * `max` - Cap for the sequence
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let min_millis = as_millis(min);
        Self {
            min_millis,
            prev_millis: 0,
            current_millis: min_millis,
            max_millis: as_millis(max).max(min_millis),
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_millis;

        let next = self.prev_millis.saturating_add(self.current_millis);
        self.prev_millis = self.current_millis;
        self.current_millis = std::cmp::min(next, self.max_millis);

        Duration::from_millis(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_millis = 0;
        self.current_millis = self.min_millis;
    }

    /// Calculate the backoff for a given error count without keeping state
    ///
    /// Returns `min` for error counts 0 and 1, then follows the sequence,
    /// capped at `max`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, min: Duration, max: Duration) -> Duration {
        let min_millis = as_millis(min);
        let max_millis = as_millis(max).max(min_millis);
        if error_count <= 1 {
            return Duration::from_millis(min_millis);
        }

        let mut prev = min_millis;
        let mut current = min_millis;
        for _ in 2..=error_count {
            let next = prev.saturating_add(current);
            prev = current;
            current = std::cmp::min(next, max_millis);
            if current >= max_millis {
                break;
            }
        }

        Duration::from_millis(current)
    }
}
