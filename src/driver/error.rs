//! Driver-specific error types.
//!
//! These are the failures of the underlying serial device itself, separate
//! from the arbitration errors in [`crate::error`]. The mediator propagates
//! them unchanged to the calling controller.

use thiserror::Error;

/// A specialized `Result` type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors that can occur while driving the serial device.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The specified serial device was not found on the system.
    #[error("serial port not found: {0}")]
    NotFound(String),

    /// An I/O error occurred during a port operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Port configuration failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Attempted to open a port that is already open.
    #[error("port is already open")]
    AlreadyOpen,

    /// Attempted to use a port that is not open.
    #[error("port is not open")]
    NotOpen,

    /// A serialport-specific error occurred.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl DriverError {
    /// Create a `NotFound` error from a port name.
    pub fn not_found(port_name: impl Into<String>) -> Self {
        Self::NotFound(port_name.into())
    }

    /// Create a `Config` error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a `Timeout` error from a duration.
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::not_found("/dev/ttyUSB0");
        assert_eq!(err.to_string(), "serial port not found: /dev/ttyUSB0");

        let err = DriverError::config("invalid baud rate");
        assert_eq!(err.to_string(), "configuration error: invalid baud rate");

        let err = DriverError::AlreadyOpen;
        assert_eq!(err.to_string(), "port is already open");
    }

    #[test]
    fn test_timeout_error() {
        let duration = std::time::Duration::from_millis(500);
        let err = DriverError::timeout(duration);
        assert!(err.to_string().contains("500ms"));
    }
}
