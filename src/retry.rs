//! Retrying chat completion requests with exponential backoff
//!
//! Only transient failures are retried: connection problems, timeouts,
//! rate limiting, and 5xx responses. Anything the model provider rejects
//! outright (bad request, auth, unknown model) fails on the first attempt.
//!
//! ```rust,no_run
//! use open_kernel::retry::{retry_with_backoff, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> open_kernel::Result<()> {
//! let config = RetryConfig::default()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_millis(250));
//!
//! let answer = retry_with_backoff(&config, || async {
//!     Ok::<_, open_kernel::Error>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// HTTP statuses worth another attempt.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Backoff schedule for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Random spread around each delay, 0.0 to 1.0
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, no retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt + 1`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let grown = base_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped = grown.min(self.max_delay.as_millis() as f64);

        let spread = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * spread - spread / 2.0;

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Whether another attempt could succeed.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Http(e) => {
            e.is_timeout()
                || e.is_connect()
                || e
                    .status()
                    .is_some_and(|s| RETRYABLE_STATUSES.contains(&s.as_u16()))
        }
        Error::Timeout => true,
        Error::Stream(_) => true,
        Error::Api(msg) => RETRYABLE_STATUSES
            .iter()
            .any(|status| msg.starts_with(&format!("HTTP {}", status))),
        _ => false,
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// Returns the last error when every attempt failed.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts && is_retryable_error(&err) => {
                let delay = config.delay_for(attempt);
                log::warn!(
                    "Request failed (attempt {}/{}): {}; retrying in {:?}",
                    attempt + 1,
                    attempts,
                    err,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
