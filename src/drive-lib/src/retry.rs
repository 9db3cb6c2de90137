use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{DriveError, DriveResult};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 100;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Bounded exponential backoff with jitter for transient store failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. 1 disables retries.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of each delay that is randomized, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(32);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        // Full delay minus a random slice of up to `jitter * delay`.
        let cut = rand::rng().random_range(0.0..=jitter);
        base.mul_f64(1.0 - cut)
    }

    /// Run `op`, retrying transient failures. Permanent failures return at once.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> DriveResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DriveResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed with transient error (attempt {}/{}), retry in {:?}: {}",
                        op_name, attempt, max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{} gave up after {} attempts: {}", op_name, attempt, e);
                        return Err(DriveError::Transient(format!(
                            "{} failed after {} attempts: {}",
                            op_name, attempt, e
                        )));
                    }
                    debug!("{} failed: {}", op_name, e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = policy.delay_for(2);
            assert!(d <= Duration::from_millis(200));
            assert!(d >= Duration::from_millis(99));
        }
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = fast_policy(3)
            .run("op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(DriveError::Transient("busy".to_string()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_bounded_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: DriveResult<()> = fast_policy(2)
            .run("op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(DriveError::Transient("busy".to_string()))
                }
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_permanent_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: DriveResult<()> = fast_policy(5)
            .run("op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(DriveError::PermissionDenied("nope".to_string()))
                }
            })
            .await;
        assert_eq!(
            result,
            Err(DriveError::PermissionDenied("nope".to_string()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
