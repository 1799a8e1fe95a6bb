//! Bounded retry with jittered exponential backoff
//!
//! Only transient substrate errors are retried. Anything else, and the last
//! transient failure once attempts run out, is surfaced to the caller.

use std::thread;
use std::time::Duration;

use rand::Rng;

use super::errors::{StoreError, StoreResult};
use crate::observability::Logger;

/// Retry parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before attempt `attempt + 1` (attempt is 1-based), with up to
    /// 50% jitter added.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let capped = exp.min(self.max_delay_ms);
        let jitter = if capped > 1 {
            rand::thread_rng().gen_range(0..=capped / 2)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter).min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `on_retry` is invoked once per retried failure.
    pub fn run<T, F, R>(&self, operation: &str, mut op: F, mut on_retry: R) -> StoreResult<T>
    where
        F: FnMut() -> StoreResult<T>,
        R: FnMut(),
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    Logger::warn(
                        "SUBSTRATE_RETRY",
                        &[
                            ("attempt", &attempt.to_string()),
                            ("delay_ms", &delay.as_millis().to_string()),
                            ("error", &e.to_string()),
                            ("operation", operation),
                        ],
                    );
                    on_retry();
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(StoreError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn transient() -> StoreError {
        StoreError::io("test", io::Error::new(io::ErrorKind::TimedOut, "slow"))
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 10,
            max_delay_ms: 50,
        };
        for attempt in 1..10 {
            assert!(policy.delay_for(attempt) <= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_transient_error_is_retried() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let mut calls = 0;
        let mut retries = 0;
        let result = policy.run(
            "op",
            || {
                calls += 1;
                if calls < 3 {
                    Err(transient())
                } else {
                    Ok(calls)
                }
            },
            || retries += 1,
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(retries, 2);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let result: StoreResult<()> = policy.run("op", || Err(transient()), || {});
        assert!(matches!(
            result,
            Err(StoreError::RetriesExhausted { attempts: 2, .. })
        ));
    }

    #[test]
    fn test_permanent_error_is_not_retried() {
        let mut calls = 0;
        let result: StoreResult<()> = RetryPolicy::default().run(
            "op",
            || {
                calls += 1;
                Err(StoreError::LockPoisoned)
            },
            || {},
        );
        assert!(matches!(result, Err(StoreError::LockPoisoned)));
        assert_eq!(calls, 1);
    }
}
