use std::{fmt, str::FromStr, time::Duration};

use serde::Deserialize;

use crate::{
    backoff::{BackOff, EqualJitterBackOff, ExponentialBackOff, FullJitterBackOff},
    Result, TdClientError,
};

/// Backoff algorithm used between retries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMechanism {
    #[default]
    Exponential,
    #[serde(alias = "fulljitter")]
    FullJitter,
    #[serde(alias = "equaljitter")]
    EqualJitter,
}

impl FromStr for RetryMechanism {
    type Err = TdClientError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "exponential" => Ok(Self::Exponential),
            "fulljitter" => Ok(Self::FullJitter),
            "equaljitter" => Ok(Self::EqualJitter),
            other => Err(TdClientError::InvalidConfiguration(format!(
                "unknown retry mechanism '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RetryMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exponential => "exponential",
            Self::FullJitter => "full_jitter",
            Self::EqualJitter => "equal_jitter",
        })
    }
}

/// Externally configurable retry parameters.
///
/// A policy is immutable configuration; per-call progress lives in
/// [`RetryState`], created fresh by [`RetryPolicy::start`].
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub mechanism: RetryMechanism,
    /// Maximum number of retries after the first attempt.
    pub retry_limit: u32,
    pub base_interval_millis: u64,
    pub max_interval_millis: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            mechanism: RetryMechanism::Exponential,
            retry_limit: 7,
            base_interval_millis: 500,
            max_interval_millis: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Builds a backoff instance for a single logical call.
    pub fn backoff(&self) -> Result<Box<dyn BackOff>> {
        let base = self.base_interval_millis;
        let max = self.max_interval_millis;
        let multiplier = self.multiplier;
        let backoff: Box<dyn BackOff> = match self.mechanism {
            RetryMechanism::Exponential => Box::new(ExponentialBackOff::new(base, max, multiplier)?),
            RetryMechanism::FullJitter => Box::new(FullJitterBackOff::new(base, max, multiplier)?),
            RetryMechanism::EqualJitter => Box::new(EqualJitterBackOff::new(base, max, multiplier)?),
        };
        Ok(backoff)
    }

    /// Total time the policy is willing to wait: `retry_limit * max_interval`.
    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(
            self.max_interval_millis
                .saturating_mul(u64::from(self.retry_limit)),
        )
    }

    pub fn validate(&self) -> Result<()> {
        self.backoff()
            .map(|_| ())
            .map_err(|err| TdClientError::InvalidConfiguration(err.to_string()))
    }

    pub fn start(&self) -> Result<RetryState> {
        Ok(RetryState {
            backoff: self.backoff()?,
            retry_limit: self.retry_limit,
            wait_budget: self.wait_budget(),
            attempts: 0,
        })
    }
}

/// Attempt counter and backoff for one logical call.
pub struct RetryState {
    backoff: Box<dyn BackOff>,
    retry_limit: u32,
    wait_budget: Duration,
    attempts: u32,
}

impl fmt::Debug for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryState")
            .field("attempts", &self.attempts)
            .field("retries", &self.backoff.execution_count())
            .field("retry_limit", &self.retry_limit)
            .finish()
    }
}

impl RetryState {
    /// Physical sends made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retries(&self) -> u32 {
        self.backoff.execution_count()
    }

    pub fn wait_budget(&self) -> Duration {
        self.wait_budget
    }

    pub(crate) fn record_send(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn should_retry(&self) -> bool {
        self.backoff.execution_count() < self.retry_limit
    }

    /// Wait computed by the backoff strategy for the upcoming retry.
    pub fn backoff_wait(&self) -> Duration {
        Duration::from_millis(self.backoff.next_wait_time_millis())
    }

    /// Consumes one retry from the budget after the wait has been decided.
    pub(crate) fn commit_retry(&mut self) {
        self.backoff.increment_execution_count();
    }
}
