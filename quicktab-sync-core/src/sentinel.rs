//! Advisory leak detection for long-lived subscriptions
//!
//! The sentinel never refuses a subscription. It only logs when the number of
//! live subscriptions grows past a threshold, and when a component is torn
//! down while subscriptions are still open.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::config::SentinelConfig;

/// Watches a subscription count and warns on suspicious growth.
#[derive(Debug)]
pub struct SubscriptionSentinel {
    owner: &'static str,
    threshold: usize,
    warned: AtomicBool,
}

impl SubscriptionSentinel {
    pub fn new(owner: &'static str, config: &SentinelConfig) -> Self {
        Self {
            owner,
            threshold: config.warn_threshold,
            warned: AtomicBool::new(false),
        }
    }

    /// Report the current subscription count.
    ///
    /// Warns the first time the count goes above the threshold. Dropping back
    /// to or below the threshold re-arms the warning.
    pub fn observe(&self, count: usize) {
        if count > self.threshold {
            if !self.warned.swap(true, Ordering::Relaxed) {
                warn!(
                    owner = self.owner,
                    count,
                    threshold = self.threshold,
                    "Subscription count above threshold, possible leak"
                );
            }
        } else {
            self.warned.store(false, Ordering::Relaxed);
        }
    }

    /// Report the count at teardown. Returns `true` if subscriptions leaked.
    pub fn check_teardown(&self, open: usize) -> bool {
        if open > 0 {
            warn!(
                owner = self.owner,
                open, "Teardown with subscriptions still open"
            );
            true
        } else {
            false
        }
    }

    /// Whether the threshold warning is currently latched
    pub fn has_warned(&self) -> bool {
        self.warned.load(Ordering::Relaxed)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warns_once_then_rearms() {
        let sentinel = SubscriptionSentinel::new("test", &SentinelConfig { warn_threshold: 2 });

        sentinel.observe(2);
        assert!(!sentinel.has_warned());

        sentinel.observe(3);
        assert!(sentinel.has_warned());
        sentinel.observe(4);
        assert!(sentinel.has_warned());

        sentinel.observe(1);
        assert!(!sentinel.has_warned());
    }

    #[test]
    fn test_teardown_reports_leaks() {
        let sentinel = SubscriptionSentinel::new("test", &SentinelConfig::default());
        assert!(!sentinel.check_teardown(0));
        assert!(sentinel.check_teardown(3));
    }
}
