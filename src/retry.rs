//! Bounded retries with exponential backoff
//!
//! Every remote call made by the readers and writers goes through one
//! [`RetryPolicy`], so opening a range and uploading a part fail and recover
//! the same way regardless of the backend.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Error, Result, TransportError};

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Executes operations with a fixed attempt ceiling and doubling delays.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    sleeper: Sleeper,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    /// Replace the function used to wait between attempts.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.config
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff)
    }

    /// Run `op` until it succeeds, fails fatally, or the attempts run out.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> std::result::Result<T, TransportError>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(TransportError::NotFound { key }) => return Err(Error::NotFound { key }),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed, retry {}/{} in {:?}: {}",
                        operation, attempt, max_attempts, delay, e
                    );
                    (self.sleeper)(delay);
                }
                Err(e) if e.is_retryable() => {
                    return Err(Error::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    return Err(Error::Transport {
                        operation: operation.to_string(),
                        source: e,
                    });
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording_policy(max_attempts: u32) -> (RetryPolicy, Arc<Mutex<Vec<Duration>>>) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&slept);
        let policy = RetryPolicy::new(RetryConfig::default().with_max_attempts(max_attempts))
            .with_sleeper(move |d| log.lock().push(d));
        (policy, slept)
    }

    #[test]
    fn test_default_schedule_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let schedule: Vec<u64> = (1..=7).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(schedule, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let (policy, slept) = recording_policy(6);
        let mut calls = 0;

        let value = policy
            .run("get", || {
                calls += 1;
                if calls <= 3 {
                    Err(TransportError::transient("connection reset"))
                } else {
                    Ok(42)
                }
            })
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls, 4);
        assert_eq!(
            *slept.lock(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let (policy, slept) = recording_policy(3);
        let mut calls = 0;

        let err = policy
            .run("upload part", || -> std::result::Result<(), _> {
                calls += 1;
                Err(TransportError::transient("timeout"))
            })
            .unwrap_err();

        assert_eq!(calls, 3);
        assert_eq!(slept.lock().len(), 2);
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
    }

    #[test]
    fn test_fatal_errors_are_not_retried() {
        let (policy, slept) = recording_policy(5);
        let mut calls = 0;

        let err = policy
            .run("get", || -> std::result::Result<(), _> {
                calls += 1;
                Err(TransportError::fatal("403 Forbidden"))
            })
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(slept.lock().is_empty());
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn test_not_found_surfaces_immediately() {
        let (policy, _) = recording_policy(5);
        let err = policy
            .run("get", || -> std::result::Result<(), _> {
                Err(TransportError::NotFound {
                    key: "bucket/missing".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { key } if key == "bucket/missing"));
    }
}
