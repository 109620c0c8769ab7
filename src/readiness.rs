//! Bounded readiness polling shared by every driver.
//!
//! Drivers describe one poll tick as a closure returning [`PollStatus`]; the
//! engine owns the interval, the attempt budget, jitter and cancellation so
//! every backend times out the same way.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::{ProviderError, ProviderResult};

/// How often and how long to poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Extra random delay per tick, as a fraction of `interval`.
    pub jitter: f64,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    fn delay(&self) -> Duration {
        if self.jitter <= 0.0 {
            return self.interval;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter.min(1.0));
        self.interval + self.interval.mul_f64(extra)
    }
}

/// Outcome of one poll tick.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus<T> {
    /// Done; polling stops with this value.
    Ready(T),
    /// Not yet. The string is the provider-native state, for logs.
    Pending(String),
    /// The provider declared the thing dead. Polling stops with an error.
    Terminal(String),
}

/// Polls `check` until it reports ready, a terminal state, or the budget runs out.
///
/// `check` receives the 1-based attempt number. A retryable error from a tick
/// (throttling, a dropped connection) counts as an attempt and polling goes
/// on; any other error is returned immediately.
///
/// # Errors
///
/// - [`ProviderError::TerminalState`] when a tick reports `Terminal`
/// - [`ProviderError::ReadinessTimeout`] after `max_attempts` ticks
/// - [`ProviderError::Cancelled`] when `cancel` fires while waiting
pub async fn poll_until<T, F, Fut>(
    what: &str,
    policy: &PollPolicy,
    cancel: Option<&CancellationToken>,
    mut check: F,
) -> ProviderResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ProviderResult<PollStatus<T>>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(ProviderError::Cancelled(format!("waiting for {}", what)));
        }

        match check(attempt).await {
            Ok(PollStatus::Ready(value)) => {
                debug!("{} ready after {} attempt(s)", what, attempt);
                return Ok(value);
            }
            Ok(PollStatus::Pending(state)) => {
                debug!("{} is {} ({}/{})", what, state, attempt, max_attempts);
            }
            Ok(PollStatus::Terminal(state)) => {
                return Err(ProviderError::TerminalState {
                    what: what.to_string(),
                    state,
                });
            }
            Err(e) if e.is_retryable() => {
                warn!("Polling {} failed, will retry: {}", what, e);
            }
            Err(e) => return Err(e),
        }

        if attempt == max_attempts {
            break;
        }

        let delay = policy.delay();
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(ProviderError::Cancelled(format!("waiting for {}", what)));
                    }
                    _ = sleep(delay) => {}
                }
            }
            None => sleep(delay).await,
        }
    }

    Err(ProviderError::ReadinessTimeout {
        what: what.to_string(),
        attempts: max_attempts,
    })
}
