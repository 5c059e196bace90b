//! Full-jitter exponential backoff around an async predicate, and a plain
//! fixed-delay retry.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Backoff {
    pub start_wait: Duration,
    pub scale_factor: f64,
    pub max_wait: Duration,
    pub timeout: Duration,
    /// Fraction of `timeout` by which the deadline is jittered either way.
    pub timeout_tolerance: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            start_wait: Duration::from_millis(200),
            scale_factor: 2.0,
            max_wait: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            timeout_tolerance: 0.1,
        }
    }
}

impl Backoff {
    pub fn with_timeout(timeout: Duration) -> Self { Self { timeout, ..Self::default() } }
}

#[derive(Debug, thiserror::Error)]
pub enum BackoffError {
    /// The deadline passed without the predicate reporting success.
    #[error("{0}")]
    Timeout(String),
    /// The predicate itself failed; not retried.
    #[error(transparent)]
    Failed(anyhow::Error),
}

/// Evaluate `pass` until it yields `Some`, sleeping
/// `min(max_wait, remaining, uniform(0, start_wait * scale))` between attempts
/// with `scale` multiplied by `scale_factor` each round.
pub async fn exponential_backoff<T, F, Fut>(mut pass: F, fail_message: &str, opts: &Backoff) -> Result<T, BackoffError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let start = Instant::now();
    let tol = opts.timeout_tolerance.clamp(0.0, 1.0) * opts.timeout.as_secs_f64();
    let jitter = if tol > 0.0 { rand::thread_rng().gen_range(-tol..=tol) } else { 0.0 };
    let deadline = start + Duration::from_secs_f64((opts.timeout.as_secs_f64() + jitter).max(0.0));

    let mut scale = 1.0f64;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Some(v) = pass().await.map_err(BackoffError::Failed)? {
            return Ok(v);
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let upper = opts.start_wait.as_secs_f64() * scale;
        let jittered = if upper > 0.0 { rand::thread_rng().gen_range(0.0..upper) } else { 0.0 };
        let dt = opts.max_wait.min(deadline - now).min(Duration::from_secs_f64(jittered));
        scale *= opts.scale_factor;
        debug!(attempt, wait_ms = %dt.as_millis(), "backoff: predicate not satisfied");
        tokio::time::sleep(dt).await;
    }
    Err(BackoffError::Timeout(fail_message.to_string()))
}

/// Call `f` up to `attempts` times, sleeping `delay` after each failure.
/// The last error is returned.
pub async fn retry<T, F, Fut>(attempts: u32, delay: Duration, mut f: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(attempt, error = %e, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
