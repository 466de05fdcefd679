//! Error types for the scope-daq stack.
//!
//! Two layers of errors exist:
//!
//! - [`DriverError`] — opaque status reported by a hardware driver. Drivers
//!   classify their failures with [`DriverErrorKind`] so callers can decide
//!   between retry, abort, and log-and-continue without parsing messages.
//! - [`AcquisitionError`] — the acquisition engine's own taxonomy: lifecycle
//!   misuse, configuration referencing channels that do not exist, and
//!   wrapped driver failures.
//!
//! Recoverable conditions (hardware buffer overruns, ring overruns) are not
//! part of either enum: they travel as [`ErrorRecord`] data on the engine's
//! error queue so that sample processing can continue.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Configuration,
    Arm,
    Poll,
    Hardware,
    /// The device's own buffer wrapped before data was retrieved, or a
    /// downstream queue could not absorb a chunk.
    Overrun,
    Shutdown,
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Arm => "arm",
            DriverErrorKind::Poll => "poll",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Overrun => "overrun",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Opaque status from the hardware layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for buffer-overrun records published on the error queue.
    pub fn overrun(driver_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::Overrun, message)
    }
}

// =============================================================================
// Acquisition Errors
// =============================================================================

/// Convenience alias for results produced by the acquisition engine.
pub type AcqResult<T> = std::result::Result<T, AcquisitionError>;

/// Errors surfaced synchronously by the acquisition engine's mutating
/// operations.
///
/// `InvalidState` and the two `Unknown*` variants are programming errors:
/// they are reported to the caller of `configure`/`arm`/... and never leave
/// the engine half-configured. `Driver` wraps a hard failure from the
/// hardware layer during initialize/configure/arm; the engine stays in its
/// prior state when one occurs.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// Lifecycle misuse, e.g. configuring an armed device.
    #[error("operation '{operation}' is not valid in the {state} state")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Configuration referenced a channel id the driver does not expose.
    #[error("unknown channel id '{0}'")]
    UnknownChannel(String),

    /// The configured trigger source is not one of the enabled channels.
    #[error("unknown trigger source '{0}'")]
    UnknownTriggerSource(String),

    /// Hard failure from the hardware layer.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Recoverable error event on the engine's process-wide error stream.
///
/// `sample_offset` is the absolute sample counter at which the condition was
/// observed. These are data, not exceptions: the consumer decides whether to
/// tolerate or escalate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub sample_offset: u64,
    pub error: DriverError,
}
