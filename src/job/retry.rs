// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Exponential backoff for retryable job failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total dispatches allowed, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Whether a job that has used `attempts` dispatches may run again
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the dispatch following attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// `now` plus `delay`, saturating at the latest representable time
pub fn deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(10), Duration::from_secs(300));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn deadline_saturates() {
        let now = Utc::now();
        assert_eq!(
            deadline(now, Duration::from_secs(30)),
            now + chrono::Duration::seconds(30)
        );
        assert_eq!(deadline(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn ceiling_counts_the_first_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }
}
