use crate::core::error;
use anyhow::Result;
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Pure retry policy: bounded attempts, exponential backoff, jitter.
/// Decoupled from the calls it wraps so the delay schedule is testable
/// without sleeping.
#[derive(Clone, Debug, Deserialize)]
pub struct RetryPolicy {
    #[serde(rename = "maxAttempts", default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(rename = "baseDelay", with = "humantime_serde", default = "default_base")]
    pub base_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(rename = "maxJitter", with = "humantime_serde", default = "default_jitter")]
    pub max_jitter: Duration,
}

fn default_attempts() -> u32 {
    3
}
fn default_base() -> Duration {
    Duration::from_millis(500)
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> Duration {
    Duration::from_millis(250)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            base_delay: default_base(),
            multiplier: default_multiplier(),
            max_jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        self.base_delay.mul_f64(factor)
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.max_jitter.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=self.max_jitter);
        base + jitter
    }

    /// Run `op` up to `max_attempts` times. Fatal errors short-circuit;
    /// every other error (transient or malformed alike) burns an attempt.
    /// Jittered sleeps between attempts avoid retry storms against a shared
    /// upstream.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if error::is_fatal(&e) {
                        return Err(e);
                    }
                    warn!(
                        "{} failed (attempt {}/{}): {:#}",
                        what,
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.jittered(self.delay_for(attempt))).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{what}: retry budget exhausted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::PipelineError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let out: Result<u32> = policy
            .run("flaky op", move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PipelineError::Timeout("slow".into()).into())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_errors_burn_the_same_budget() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let out: Result<u32> = policy
            .run("bad json", move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::Malformed("not json".into()).into())
                }
            })
            .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_do_not_retry() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let out: Result<u32> = policy
            .run("missing input", move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::InvalidInput("no image".into()).into())
                }
            })
            .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
