//! Exponential backoff and polling
//!
//! Every wait loop in the hook (pod phases, job completion, container health)
//! goes through [`poll_until`]. Delays double from 1s up to a 20s cap with no
//! jitter: 1, 2, 4, 8, 16, 20, 20, ...

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{HookError, Result};

/// First delay between attempts
pub const INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for a single delay
pub const MAX_DELAY: Duration = Duration::from_secs(20);

/// Deterministic exponential backoff with an optional total budget
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    slept: Duration,
    budget: Option<Duration>,
    max_attempts: Option<u32>,
}

impl Backoff {
    /// Backoff without a time budget
    pub fn new() -> Self {
        Self {
            delay: INITIAL_DELAY,
            slept: Duration::ZERO,
            budget: None,
            max_attempts: None,
        }
    }

    /// Backoff that fails once the cumulative sleep exceeds `budget`
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            budget: (!budget.is_zero()).then_some(budget),
            ..Self::new()
        }
    }

    /// Limits [`poll_until`] to `attempts` evaluations of its step
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Delay the next call to [`Backoff::wait`] will sleep for
    pub fn next_delay(&self) -> Duration {
        self.delay
    }

    /// Total time slept so far
    pub fn slept(&self) -> Duration {
        self.slept
    }

    /// Sleeps for the current delay, then doubles it
    ///
    /// Fails with [`HookError::Timeout`] when the cumulative sleep has
    /// exceeded the budget.
    pub async fn wait(&mut self, what: &str) -> Result<()> {
        debug!("Waiting {:?} before retrying {}", self.delay, what);
        tokio::time::sleep(self.delay).await;
        self.slept += self.delay;

        if let Some(budget) = self.budget {
            if self.slept > budget {
                return Err(HookError::Timeout(format!(
                    "{} did not complete within {}s",
                    what,
                    budget.as_secs()
                )));
            }
        }

        self.delay = (self.delay * 2).min(MAX_DELAY);
        Ok(())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one polling step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// The awaited condition holds
    Done(T),
    /// Not there yet, back off and try again
    Retry,
}

/// Evaluates `step` until it is done, fails, or the backoff gives up
///
/// A step returning `Err` is a terminal failure and is returned as is.
pub async fn poll_until<T, F, Fut>(mut backoff: Backoff, what: &str, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Step<T>>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match step().await? {
            Step::Done(value) => return Ok(value),
            Step::Retry => {
                if backoff.max_attempts.is_some_and(|max| attempts >= max) {
                    return Err(HookError::Timeout(format!(
                        "{} did not complete after {} attempts",
                        what, attempts
                    )));
                }
                backoff.wait(what).await?;
            }
        }
    }
}
