//! Consecutive MAC no-acknowledgment tracking per next hop

use std::collections::HashMap;
use tracing::{debug, warn};

/// Consecutive no-ACKs before a relay is treated as unreliable
pub const DEFAULT_NO_ACK_THRESHOLD: u32 = 3;
/// Failures older than this start a fresh count
pub const DEFAULT_NO_ACK_WINDOW_MS: u64 = 60_000;

/// Tracks transmissions a next hop failed to acknowledge
#[derive(Debug, Clone)]
pub struct NoAckTracker {
    /// Failure info per short address
    failures: HashMap<u16, FailureInfo>,
    /// Count at which the address is considered unreliable
    threshold: u32,
    /// Window for counting consecutive failures
    window_ms: u64,
}

#[derive(Debug, Clone)]
struct FailureInfo {
    /// Consecutive failures in the current window
    count: u32,
    /// First failure in the current window
    first_failure_ms: u64,
    /// Most recent failure
    last_failure_ms: u64,
    /// Threshold crossing already reported
    reported: bool,
}

impl NoAckTracker {
    /// Create a tracker
    pub fn new(threshold: u32, window_ms: u64) -> Self {
        Self {
            failures: HashMap::new(),
            threshold,
            window_ms,
        }
    }

    /// Record a no-ACK; returns the count and whether the threshold was just crossed
    pub fn record_failure(&mut self, address: u16, now_ms: u64) -> (u32, bool) {
        let info = self.failures.entry(address).or_insert(FailureInfo {
            count: 0,
            first_failure_ms: now_ms,
            last_failure_ms: now_ms,
            reported: false,
        });

        if now_ms.saturating_sub(info.first_failure_ms) > self.window_ms {
            info.count = 1;
            info.first_failure_ms = now_ms;
            info.reported = false;
        } else {
            info.count += 1;
        }
        info.last_failure_ms = now_ms;

        let crossed = info.count >= self.threshold && !info.reported;
        if crossed {
            info.reported = true;
            warn!(
                "Next hop 0x{:04x} unreliable after {} missed acknowledgments",
                address, info.count
            );
        }

        debug!("No-ACK from 0x{:04x} (count: {})", address, info.count);
        (info.count, crossed)
    }

    /// Record a delivered frame; returns whether the address had been unreliable
    pub fn record_success(&mut self, address: u16) -> bool {
        match self.failures.remove(&address) {
            Some(info) => {
                if info.reported {
                    debug!("Next hop 0x{:04x} recovered", address);
                }
                info.reported
            }
            None => false,
        }
    }

    /// Current consecutive failure count
    pub fn count(&self, address: u16) -> u32 {
        self.failures.get(&address).map(|info| info.count).unwrap_or(0)
    }

    /// Whether routes through this address should be avoided
    pub fn is_unreliable(&self, address: u16) -> bool {
        self.count(address) >= self.threshold
    }

    /// Forget the address entirely
    pub fn forget(&mut self, address: u16) {
        self.failures.remove(&address);
    }

    /// Drop records idle for more than two windows
    pub fn cleanup(&mut self, now_ms: u64) {
        let horizon = self.window_ms * 2;
        self.failures
            .retain(|_, info| now_ms.saturating_sub(info.last_failure_ms) < horizon);
    }
}

impl Default for NoAckTracker {
    fn default() -> Self {
        Self::new(DEFAULT_NO_ACK_THRESHOLD, DEFAULT_NO_ACK_WINDOW_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_reported_once() {
        let mut tracker = NoAckTracker::default();
        assert_eq!(tracker.record_failure(0x1234, 0), (1, false));
        assert_eq!(tracker.record_failure(0x1234, 10), (2, false));
        assert_eq!(tracker.record_failure(0x1234, 20), (3, true));
        assert_eq!(tracker.record_failure(0x1234, 30), (4, false));
        assert!(tracker.is_unreliable(0x1234));

        assert!(tracker.record_success(0x1234));
        assert_eq!(tracker.count(0x1234), 0);
        assert!(!tracker.record_success(0x1234));
    }

    #[test]
    fn test_window_restarts_count() {
        let mut tracker = NoAckTracker::new(3, 1_000);
        tracker.record_failure(0x0001, 0);
        tracker.record_failure(0x0001, 500);
        assert_eq!(tracker.record_failure(0x0001, 2_000), (1, false));

        tracker.cleanup(10_000);
        assert_eq!(tracker.count(0x0001), 0);
    }
}
