//! Bounded exponential backoff with jitter, shared by the worker's model
//! transport retries and the orchestrator's registry submissions.

use std::time::Duration;

use rand::Rng;

/// Default transport retry policy: 3 attempts, base 1s, factor 2,
/// jitter ±25%.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
    /// Fractional jitter applied symmetrically, e.g. 0.25 for ±25%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            factor: 2,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-based), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * (self.factor as f64).powi(attempt as i32);
        let spread = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((base * spread) as u64)
    }
}

/// Outcome classification for [`with_backoff`]: transient errors retry,
/// permanent ones surface immediately.
pub enum RetryClass {
    Transient,
    Permanent,
}

/// Run `op` up to `policy.max_retries + 1` times, sleeping between
/// attempts. `classify` decides whether an error is worth another try;
/// `on_retry` is called before each sleep so callers can audit-log.
pub async fn with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    classify: impl Fn(&E) -> RetryClass,
    mut on_retry: impl FnMut(u32, &E),
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || matches!(classify(&err), RetryClass::Permanent)
                {
                    return Err(err);
                }
                on_retry(attempt + 1, &err);
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}
