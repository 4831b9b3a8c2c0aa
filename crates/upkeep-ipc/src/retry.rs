use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TransportError;

/// Bounded exponential backoff for notifications that must reach a peer that may not have
/// connected yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt `attempt` (1-based): doubling from the initial backoff, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|attempt| self.delay_after(attempt))
    }

    /// Repeats `attempt` until it reports acceptance. Returns the number of attempts used.
    ///
    /// A transient transport error counts as "not accepted" and is retried like any other
    /// unheard attempt. Errors that no retry can fix, such as an oversized frame, end the loop.
    pub fn deliver<F>(&self, mut attempt: F) -> Result<u32, TransportError>
    where
        F: FnMut() -> Result<bool, TransportError>,
    {
        let max_attempts = self.max_attempts.max(1);
        for number in 1..=max_attempts {
            match attempt() {
                Ok(true) => return Ok(number),
                Ok(false) => {}
                Err(err) if err.is_transient() => {
                    warn!(attempt = number, error = %err, "notification attempt failed");
                }
                Err(err) => return Err(err),
            }
            if number < max_attempts {
                let delay = self.delay_after(number);
                debug!(attempt = number, delay_ms = delay.as_millis() as u64, "notification not accepted yet");
                thread::sleep(delay);
            }
        }
        Err(TransportError::NotDelivered {
            attempts: max_attempts,
        })
    }
}
