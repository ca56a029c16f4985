//! Bounded retry of hardware commands.
//
// Only the "start exposure" command goes through here. Faults detected while the
// exposure is running are handled by the acquisition worker's restart logic, and
// a failure reported by this module is never retried again by the worker.

use crate::config::RetryConfig;
use crate::error::{EngineError, EngineResult, HardwareError};
use crate::hardware::CameraHardware;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_delay: config.backoff,
        }
    }
}

/// An asynchronous operation that can be retried.
#[async_trait]
pub trait Recoverable<E> {
    /// Perform one attempt.
    async fn attempt(&mut self) -> Result<(), E>;
}

/// Runs `operation` until it succeeds or the policy is exhausted.
///
/// Sleeps `backoff_delay` between attempts, never after the last one. On success
/// returns the number of attempts used; on failure returns the last error.
pub async fn retry_with_policy<T, E>(operation: &mut T, policy: &RetryPolicy) -> Result<u32, E>
where
    T: Recoverable<E> + Send,
    E: std::fmt::Display + Send,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation.attempt().await {
            Ok(()) => return Ok(attempt),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!(attempt, max_attempts = attempts, error = %e, "Attempt failed, retrying");
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
        }
    }
}

/// The hardware "start exposure" command as a retryable operation.
pub struct ExposureStart<'a> {
    hardware: &'a dyn CameraHardware,
    duration_us: u64,
    is_dark: bool,
}

impl<'a> ExposureStart<'a> {
    /// Build the start command for one exposure.
    pub fn new(hardware: &'a dyn CameraHardware, duration: Duration, is_dark: bool) -> Self {
        Self {
            hardware,
            duration_us: u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
            is_dark,
        }
    }

    /// Issue the command under `policy`, mapping exhaustion to `FatalHardware`.
    pub async fn run(mut self, policy: &RetryPolicy) -> EngineResult<()> {
        match retry_with_policy(&mut self, policy).await {
            Ok(attempts) => {
                debug!(attempts, duration_us = self.duration_us, "Exposure started");
                Ok(())
            }
            Err(e) => Err(EngineError::FatalHardware(format!(
                "failed to start exposure after {} attempts: {}",
                policy.max_attempts.max(1),
                e
            ))),
        }
    }
}

#[async_trait]
impl Recoverable<HardwareError> for ExposureStart<'_> {
    async fn attempt(&mut self) -> Result<(), HardwareError> {
        self.hardware
            .start_exposure(self.duration_us, self.is_dark)
            .await
    }
}
