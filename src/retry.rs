use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Retry policy applied uniformly to Origin HTTP calls and webhook refresh:
/// exponential backoff with a base delay, a cap, a bounded attempt count,
/// and jitter so concurrent per-project retries don't thunder-herd.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            attempts: 5,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << attempt.min(20));
        let capped = exp.min(self.cap.as_millis());
        let jitter_frac = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_millis((capped as f64 * jitter_frac) as u64)
    }
}

/// Whether a result should be retried. `true` loops again (subject to the
/// attempt budget); `false` returns immediately with `Ok` or `Err`.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    mut should_retry: impl FnMut(&Result<T, E>) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        let result = op().await;
        attempt += 1;
        if attempt >= policy.attempts || !should_retry(&result) {
            return result;
        }
        tokio::time::sleep(policy.delay_for(attempt - 1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_stops_once_should_retry_is_false() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            attempts: 5,
        };
        let result: Result<i32, &str> = retry(
            policy,
            |r: &Result<i32, &str>| r.is_err(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_attempt_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            attempts: 3,
        };
        let result: Result<i32, &str> = retry(
            policy,
            |r: &Result<i32, &str>| r.is_err(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
