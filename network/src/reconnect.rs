//! Linear reconnection backoff for the signaling link.

use settings_manager::ReconnectSettings;
use std::time::Duration;

/// Counts reconnection attempts and yields the delay before each one.
///
/// Attempt `n` (1-indexed) waits `base_delay * n`. Once `max_attempts`
/// retries have been handed out the policy refuses further ones until it is
/// reset by a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt_count: u32,
    max_attempts: u32,
    base_delay: Duration,
}

impl ReconnectPolicy {
    /// Create a new policy with no attempts made
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt_count: 0,
            max_attempts,
            base_delay,
        }
    }

    /// Create a policy from the `[reconnect]` settings
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(settings.max_attempts, settings.base_delay())
    }

    /// Retries handed out since the last reset
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay for the 1-indexed `attempt`, or `None` past the limit
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.base_delay * attempt)
    }

    /// Claim the next retry, returning how long to wait before it
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.delay_for(self.attempt_count + 1)?;
        self.attempt_count += 1;
        Some(delay)
    }

    /// Whether every retry has been used
    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Forget previous attempts
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}
