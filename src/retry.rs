//! Exponential backoff for outbound HTTP calls.

use reqwest::header::RETRY_AFTER;
use reqwest::Response;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::RemoteError;

const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Which failures to retry, how often, and how long to wait in between.
///
/// The wait before retry `n` (1-based) is `factor * 2^(n-1)`, capped at
/// `max_backoff`. A `Retry-After` header on a retryable response takes
/// precedence over the computed delay.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub factor: Duration,
    pub max_backoff: Duration,
    pub retry_statuses: Vec<u16>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::rate_limit(8)
    }
}

impl BackoffPolicy {
    /// Retries HTTP 429 only; every other failure surfaces immediately.
    pub fn rate_limit(max_retries: u32) -> Self {
        Self {
            max_retries,
            factor: Duration::from_secs(1),
            max_backoff: DEFAULT_MAX_BACKOFF,
            retry_statuses: vec![429],
        }
    }

    pub fn with_factor(mut self, factor: Duration) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn backoff_for_retry(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let delay = self.factor.saturating_mul(1u32 << exp);
        delay.min(self.max_backoff)
    }

    pub fn should_retry(&self, error: &RemoteError) -> bool {
        error
            .status()
            .is_some_and(|status| self.retry_statuses.contains(&status))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    pub async fn run<T, F, Fut>(&self, url: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut retries = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(&e) => {
                    if retries >= self.max_retries {
                        return Err(RemoteError::RetriesExhausted {
                            url: url.to_string(),
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    let delay = e
                        .retry_after()
                        .map(|d| d.min(self.max_backoff))
                        .unwrap_or_else(|| self.backoff_for_retry(retries));
                    warn!(
                        "{} rate limited ({}), retry {}/{} in {:?}",
                        url, e, retries, self.max_retries, delay
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Turns a non-2xx response into [`RemoteError::Status`], keeping the body and
/// any numeric `Retry-After`. Values beyond what a `Duration` holds saturate.
pub async fn ensure_success(url: &str, response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| *secs >= 0.0)
        // too large for a Duration: wait as long as the policy allows
        .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX));
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
        retry_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn status(code: u16) -> RemoteError {
        RemoteError::Status {
            url: "http://test".to_string(),
            status: code,
            body: String::new(),
            retry_after: None,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy::rate_limit(8).with_factor(Duration::from_secs(1));
        assert_eq!(policy.backoff_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_retry(4), Duration::from_secs(8));
        assert_eq!(policy.backoff_for_retry(20), Duration::from_secs(120));
        assert_eq!(policy.backoff_for_retry(u32::MAX), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn retries_rate_limits_until_success() {
        let policy = BackoffPolicy::rate_limit(8).with_factor(Duration::from_millis(10));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = Instant::now();

        let result = policy
            .run("http://test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(status(429))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 10 + 20 + 40 ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let policy = BackoffPolicy::rate_limit(8).with_factor(Duration::from_millis(1));
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = policy
            .run("http://test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(status(500))
            })
            .await;

        assert!(matches!(result, Err(RemoteError::Status { status: 500, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_reported() {
        let policy = BackoffPolicy::rate_limit(2).with_factor(Duration::from_millis(1));
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = policy
            .run("http://test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(status(429))
            })
            .await;

        assert!(matches!(
            result,
            Err(RemoteError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_after_is_capped_by_policy() {
        let policy = BackoffPolicy::rate_limit(1)
            .with_factor(Duration::from_secs(60))
            .with_max_backoff(Duration::from_millis(20));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = Instant::now();

        let result = policy
            .run("http://test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RemoteError::Status {
                        url: "http://test".to_string(),
                        status: 429,
                        body: String::new(),
                        retry_after: Some(Duration::from_secs(3600)),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        // capped by max_backoff rather than the hour the server asked for
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
