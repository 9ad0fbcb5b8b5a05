//! Small helper for rate-limiting repeated warnings, keyed by a message
//! hash, so a noisy condition logs at most once per interval instead of
//! once per frame.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Tracks the last-seen wall-clock-equivalent "now" for each distinct
/// message. Driven by an explicit `now` (session-time or a monotonic
/// counter) rather than `Instant::now()` so callers can use simulated
/// time in tests.
pub struct RateLimiter {
    interval: Duration,
    last_logged: HashMap<u64, f64>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: HashMap::new(),
        }
    }

    /// Returns `true` if a message with this content should be logged
    /// now, given the current time `now` (in seconds).
    pub fn should_log(&mut self, message: &str, now: f64) -> bool {
        let key = hash_message(message);
        let interval_secs = self.interval.as_secs_f64();
        match self.last_logged.get(&key) {
            Some(&last) if now - last < interval_secs => false,
            _ => {
                self.last_logged.insert(key, now);
                true
            }
        }
    }
}

fn hash_message(message: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    message.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_always_logs() {
        let mut rl = RateLimiter::new(Duration::from_secs(5));
        assert!(rl.should_log("boom", 0.0));
    }

    #[test]
    fn suppresses_repeats_within_interval() {
        let mut rl = RateLimiter::new(Duration::from_secs(5));
        assert!(rl.should_log("boom", 0.0));
        assert!(!rl.should_log("boom", 1.0));
        assert!(!rl.should_log("boom", 4.9));
        assert!(rl.should_log("boom", 5.1));
    }

    #[test]
    fn distinct_messages_tracked_independently() {
        let mut rl = RateLimiter::new(Duration::from_secs(5));
        assert!(rl.should_log("a", 0.0));
        assert!(rl.should_log("b", 0.0));
    }
}
