//! Bounded-backoff polling of asynchronous remote work.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::backoff::ExponentialBackoff;
use crate::error::{KrisError, Result};

/// How long to wait between checks and when to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Overall elapsed-time budget. `None` polls until a terminal value.
    pub max_elapsed: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_elapsed: Some(Duration::from_secs(60 * 60)),
        }
    }
}

impl PollPolicy {
    pub fn without_deadline(self) -> Self {
        Self {
            max_elapsed: None,
            ..self
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_delay, self.max_delay, 0)
    }
}

/// `[poll]` table of `config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub initial_delay_secs: Option<u64>,
    pub max_delay_secs: Option<u64>,
    pub max_elapsed_secs: Option<u64>,
}

impl PollSettings {
    pub fn policy(&self) -> PollPolicy {
        let defaults = PollPolicy::default();
        PollPolicy {
            initial_delay: self
                .initial_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.initial_delay),
            max_delay: self
                .max_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_delay),
            max_elapsed: match self.max_elapsed_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.max_elapsed,
            },
        }
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    Ready(T),
    /// Not terminal yet; carries a description of the observed state.
    Pending(String),
}

/// Invoke `check` until it returns [`Progress::Ready`].
///
/// The first check runs immediately. Between checks the loop sleeps along an
/// exponential sequence capped at `policy.max_delay`. When the next sleep
/// would overrun `policy.max_elapsed` the loop stops with
/// [`KrisError::AmbiguousRemoteStatus`]. Check errors propagate as-is.
pub async fn poll_until<T, F, Fut>(policy: PollPolicy, operation: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress<T>>>,
{
    let started = Instant::now();
    let mut backoff = policy.backoff();

    loop {
        let last_status = match check().await? {
            Progress::Ready(value) => return Ok(value),
            Progress::Pending(status) => status,
        };

        let delay = backoff.next_delay().unwrap_or(policy.max_delay);
        if let Some(budget) = policy.max_elapsed
            && started.elapsed() + delay > budget
        {
            return Err(KrisError::AmbiguousRemoteStatus {
                operation: operation.to_string(),
                last_status,
            });
        }

        debug!(operation, status = %last_status, delay_ms = delay.as_millis() as u64, "not finished yet");
        tokio::time::sleep(delay).await;
    }
}
