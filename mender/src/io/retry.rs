//! Resilient invocation: exponential-backoff retries around unreliable calls.

use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Error, Result};
use regex::Regex;
use tracing::{debug, warn};

use crate::core::error::MenderError;
use crate::io::config::RetryConfig;

/// Errors matching this are credential problems that no retry will fix.
static AUTH_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)invalid[_ ]api[_ ]key|authentication|unauthori[sz]ed|credential").unwrap()
});

/// Clock used between attempts. Tests record delays instead of sleeping.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            exponential_base: cfg.exponential_base,
        }
    }
}

impl RetryPolicy {
    /// Delay that follows `delay`, capped at `max_delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let scaled = delay.as_secs_f64() * self.exponential_base;
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Run `call` until it succeeds, fails fatally, or the attempt budget runs out.
    ///
    /// `call` receives the 1-based attempt number. Fatal failures carry
    /// [`MenderError::FatalService`] and exhaustion carries
    /// [`MenderError::MaxRetriesExceeded`], each wrapping the last underlying error.
    pub fn run<T, F>(&self, operation: &str, sleeper: &dyn Sleeper, mut call: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            let err = match call(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if is_fatal(&err) {
                warn!(operation, attempt, err = %format!("{err:#}"), "fatal error, not retrying");
                return Err(mark_fatal(err));
            }
            if attempt >= self.max_attempts {
                warn!(operation, attempts = attempt, err = %format!("{err:#}"), "retries exhausted");
                return Err(err.context(MenderError::MaxRetriesExceeded { attempts: attempt }));
            }

            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                err = %format!("{err:#}"),
                "call failed, retrying"
            );
            sleeper.sleep(delay);
            delay = self.next_delay(delay);
            attempt += 1;
        }
    }
}

/// Whether `err` is a credential-class failure.
pub fn is_fatal(err: &Error) -> bool {
    matches!(MenderError::find(err), Some(MenderError::FatalService))
        || AUTH_FAILURE_RE.is_match(&format!("{err:#}"))
}

fn mark_fatal(err: Error) -> Error {
    if matches!(MenderError::find(&err), Some(MenderError::FatalService)) {
        err
    } else {
        err.context(MenderError::FatalService)
    }
}
