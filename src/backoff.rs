use rand::Rng;

use crate::{Result, TdClientError};

/// Computes the wait before the next retry of one logical call.
///
/// A backoff instance is owned by a single call and discarded with it;
/// nothing here is shared between concurrent calls.
pub trait BackOff: Send {
    /// Wait in milliseconds for the current execution count.
    fn next_wait_time_millis(&self) -> u64;

    /// Records one completed attempt.
    fn increment_execution_count(&mut self);

    fn execution_count(&self) -> u32;
}

/// Parameters shared by every backoff strategy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackOffParams {
    base_interval_millis: u64,
    max_interval_millis: u64,
    multiplier: f64,
    execution_count: u32,
}

impl BackOffParams {
    /// Validates the parameters.
    ///
    /// Fails with [`TdClientError::InvalidInput`] when any of the three
    /// values is not strictly positive.
    pub fn new(base_interval_millis: u64, max_interval_millis: u64, multiplier: f64) -> Result<Self> {
        if base_interval_millis == 0 {
            return Err(TdClientError::InvalidInput(
                "backoff base interval must be greater than 0".to_owned(),
            ));
        }
        if max_interval_millis == 0 {
            return Err(TdClientError::InvalidInput(
                "backoff max interval must be greater than 0".to_owned(),
            ));
        }
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(TdClientError::InvalidInput(format!(
                "backoff multiplier must be a positive number, got {multiplier}"
            )));
        }
        Ok(Self {
            base_interval_millis,
            max_interval_millis,
            multiplier,
            execution_count: 0,
        })
    }

    pub fn base_interval_millis(&self) -> u64 {
        self.base_interval_millis
    }

    pub fn max_interval_millis(&self) -> u64 {
        self.max_interval_millis
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// `min(max, base * multiplier^execution_count)`.
    fn exponential_millis(&self) -> u64 {
        let exp = i32::try_from(self.execution_count).unwrap_or(i32::MAX);
        let raw = self.base_interval_millis as f64 * self.multiplier.powi(exp);
        if !raw.is_finite() || raw >= self.max_interval_millis as f64 {
            self.max_interval_millis
        } else {
            raw as u64
        }
    }
}

macro_rules! impl_backoff_state {
    ($ty:ty) => {
        impl $ty {
            pub fn new(
                base_interval_millis: u64,
                max_interval_millis: u64,
                multiplier: f64,
            ) -> Result<Self> {
                BackOffParams::new(base_interval_millis, max_interval_millis, multiplier)
                    .map(Self)
            }

            pub fn params(&self) -> &BackOffParams {
                &self.0
            }
        }
    };
}

/// Plain exponential growth capped at the max interval.
#[derive(Clone, Debug)]
pub struct ExponentialBackOff(BackOffParams);

/// Uniformly random wait in `[0, exponential)`.
///
/// Always strictly below the max interval.
#[derive(Clone, Debug)]
pub struct FullJitterBackOff(BackOffParams);

/// Half of the exponential value plus a random share of the other half.
///
/// Always strictly below the max interval.
#[derive(Clone, Debug)]
pub struct EqualJitterBackOff(BackOffParams);

impl_backoff_state!(ExponentialBackOff);
impl_backoff_state!(FullJitterBackOff);
impl_backoff_state!(EqualJitterBackOff);

impl BackOff for ExponentialBackOff {
    fn next_wait_time_millis(&self) -> u64 {
        self.0.exponential_millis()
    }

    fn increment_execution_count(&mut self) {
        self.0.execution_count = self.0.execution_count.saturating_add(1);
    }

    fn execution_count(&self) -> u32 {
        self.0.execution_count
    }
}

impl BackOff for FullJitterBackOff {
    fn next_wait_time_millis(&self) -> u64 {
        let exponential = self.0.exponential_millis();
        if exponential == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..exponential)
    }

    fn increment_execution_count(&mut self) {
        self.0.execution_count = self.0.execution_count.saturating_add(1);
    }

    fn execution_count(&self) -> u32 {
        self.0.execution_count
    }
}

impl BackOff for EqualJitterBackOff {
    fn next_wait_time_millis(&self) -> u64 {
        let half = self.0.exponential_millis() / 2;
        if half == 0 {
            return 0;
        }
        half + rand::thread_rng().gen_range(0..half)
    }

    fn increment_execution_count(&mut self) {
        self.0.execution_count = self.0.execution_count.saturating_add(1);
    }

    fn execution_count(&self) -> u32 {
        self.0.execution_count
    }
}
