//! Custom error types for the bench.
//!
//! This module defines `BenchError`, the single error type returned by every device
//! controller, the scan orchestrator and the storage layer. It is built with `thiserror`
//! so that lower-level failures convert with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Communication`**: the serial link could not be opened, written or read. Carries the
//!   port name and the underlying I/O cause.
//! - **`Protocol`**: the device answered, but with an unexpected acknowledgement or a
//!   malformed response.
//! - **`Range`**: a wavelength or filter index outside the bounds the hardware accepts.
//!   Always raised before anything is written to a port.
//! - **`DeviceStatus`**: a status poll returned the reserved "unreadable" sentinel.
//! - **`PollLimitExceeded`**: a polling loop ran out of attempts before the device reported
//!   the expected state.
//! - **`Configuration`** / **`Config`**: semantic and parse-level configuration problems.
//! - **`ScanAborted`**: a fatal device error during a scan, wrapped with the scan state,
//!   wavelength and filter at the time of failure so the operator can resume manually.

use crate::experiment::state::ScanState;
use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type AppResult<T> = std::result::Result<T, BenchError>;

/// Every failure the bench can report.
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Communication error on {port}: {source}")]
    Communication {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error on {port}: {message}")]
    Protocol { port: String, message: String },

    #[error("Out of range: {0}")]
    Range(String),

    #[error("Device status error on {port} during {operation}: {status}")]
    DeviceStatus {
        port: String,
        operation: String,
        status: String,
    },

    #[error("{operation} on {port} did not complete after {attempts} attempts")]
    PollLimitExceeded {
        port: String,
        operation: String,
        attempts: u32,
    },

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Invalid scan transition from {from} to {to}")]
    InvalidTransition { from: ScanState, to: ScanState },

    #[error("Scan aborted during {state} (wavelength {wavelength:?} nm, filter {filter:?}): {source}")]
    ScanAborted {
        state: ScanState,
        wavelength: Option<f64>,
        filter: Option<u8>,
        #[source]
        source: Box<BenchError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    /// Wrap an I/O failure on `port` as a communication error.
    pub fn communication(port: impl Into<String>, source: std::io::Error) -> Self {
        BenchError::Communication {
            port: port.into(),
            source,
        }
    }

    /// Build a protocol error for `port`.
    pub fn protocol(port: impl Into<String>, message: impl Into<String>) -> Self {
        BenchError::Protocol {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Whether the error came from talking to a device (as opposed to configuration,
    /// storage or the scan bookkeeping).
    pub fn is_device_error(&self) -> bool {
        match self {
            BenchError::Communication { .. }
            | BenchError::Protocol { .. }
            | BenchError::DeviceStatus { .. }
            | BenchError::PollLimitExceeded { .. }
            | BenchError::Camera(_) => true,
            BenchError::ScanAborted { source, .. } => source.is_device_error(),
            _ => false,
        }
    }
}
