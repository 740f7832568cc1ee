//! Bounded retry for networked calls.
//!
//! Only transient failures are retried (see [`Error::is_transient`]).
//! Definitive answers such as "already exists" or a missing label return
//! immediately so the caller can react to them.

use std::future::Future;
use std::time::Duration;

use crate::{flog_warn, Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before retry N; the last entry repeats if attempts outnumber it.
    delays: Vec<Duration>,
    attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(30),
            ],
        )
    }
}

impl RetryPolicy {
    pub fn new(attempts: usize, delays: Vec<Duration>) -> Self {
        Self {
            delays,
            attempts: attempts.max(1),
        }
    }

    /// Same attempt count without any waiting.
    pub fn immediate(attempts: usize) -> Self {
        Self::new(attempts, Vec::new())
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    fn delay_after(&self, attempt: usize) -> Duration {
        self.delays
            .get(attempt)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }

    /// Run `op` until it succeeds, fails definitively, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.delay_after(attempt);
                    flog_warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt + 1,
                        self.attempts,
                        delay,
                        e
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether an error means "retry without the label".
pub fn is_missing_label(error: &Error) -> bool {
    matches!(error, Error::LabelMissing(_))
}
