//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `EngineError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! report what went wrong with an exposure, a cooler request or a guide pulse.
//!
//! ## Error Hierarchy
//!
//! `EngineError` consolidates the failure classes a caller has to tell apart:
//!
//! - **`BadRequest`**: Invalid arguments (negative duration, binning out of range,
//!   unsupported pixel format, unknown control). Rejected synchronously.
//! - **`Busy`**: An exposure is already active. Rejected synchronously, never queued.
//! - **`TransientHardware`**: A retryable start/status fault. Only surfaced once the
//!   local retry budget is exhausted.
//! - **`FatalHardware`**: The hardware failed after retries, or failed in a way that
//!   cannot be retried (lost exposure, repeated communication timeouts).
//! - **`Cancelled`**: The user aborted the exposure. Abort always wins over a
//!   concurrently detected failure.
//! - **`OutOfMemory`**: The frame buffer could not be allocated.
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type issues.
//!
//! Hardware calls report [`HardwareError`], which converts into `EngineError::Hardware`
//! with `?` when no more specific classification applies.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Convenience alias for results of raw hardware calls.
pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

/// Errors reported by an implementation of [`CameraHardware`](crate::hardware::CameraHardware).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// The call did not complete within its communication timeout.
    #[error("Hardware communication timed out")]
    Timeout,

    /// The device answered but refused the command.
    #[error("Hardware rejected command (code {code}): {message}")]
    Rejected {
        /// Vendor status code.
        code: i32,
        /// Human readable description.
        message: String,
    },

    /// The device is gone.
    #[error("Hardware disconnected")]
    Disconnected,
}

impl HardwareError {
    /// Shorthand for a rejected command.
    pub fn rejected(code: i32, message: impl Into<String>) -> Self {
        HardwareError::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Whether this failure counts against the communication-timeout budget.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HardwareError::Timeout)
    }
}

/// Top-level error type of the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid argument, rejected before anything reaches the hardware.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Another exposure is active.
    #[error("Exposure already in progress")]
    Busy,

    /// Retryable start or status fault.
    #[error("Transient hardware fault: {0}")]
    TransientHardware(String),

    /// Unrecoverable hardware failure.
    #[error("Hardware failure: {0}")]
    FatalHardware(String),

    /// The caller aborted the exposure.
    #[error("Exposure cancelled")]
    Cancelled,

    /// The frame buffer could not be allocated.
    #[error("Out of memory allocating {bytes} byte frame buffer")]
    OutOfMemory {
        /// Requested allocation size.
        bytes: usize,
    },

    /// A configuration source could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values were parsed but are invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The session has been disconnected.
    #[error("Camera not connected")]
    NotConnected,

    /// Unclassified hardware error.
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),
}

impl EngineError {
    /// Whether this error was produced by a user abort.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
