//! Backpressure policy.
//!
//! A queue whose backlog keeps growing usually means a peer has been offline
//! for a while. Producers check the approximate depth before pushing and
//! defer while it is above the threshold.

use std::time::Duration;

/// When and how long producers hold off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Depth above which producers are throttled.
    pub threshold: u64,
    /// Pause between depth re-checks while throttled.
    pub defer: Duration,
    /// Re-checks before giving up on this push.
    pub max_deferrals: u32,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            threshold: 1_000,
            defer: Duration::from_secs(5),
            max_deferrals: 3,
        }
    }
}

impl ThrottlePolicy {
    /// Whether a queue at `depth` should throttle producers.
    pub fn is_throttled(&self, depth: u64) -> bool {
        depth > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_only_above_threshold() {
        let policy = ThrottlePolicy {
            threshold: 10,
            ..ThrottlePolicy::default()
        };
        assert!(!policy.is_throttled(0));
        assert!(!policy.is_throttled(10));
        assert!(policy.is_throttled(11));
    }
}
