//! Common error types for hsm-link.
//!
//! This module provides a centralized Error enum using thiserror. The three
//! outcomes callers must be able to tell apart (no device, transport failure,
//! interruption) each get their own variant.

use std::time::Duration;
use thiserror::Error;

/// Main error type for hsm-link operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No enumerated transport passed the probe
    #[error("HSM device not found")]
    DeviceNotFound,

    /// Cancellation was requested while blocked
    #[error("operation interrupted")]
    Interrupted,

    /// Open, write or read failure on the serial transport
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The device answered a LOCK request with a nonzero status
    #[error("device rejected lock request (status {0:#04x})")]
    LockRejected(u8),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failures at the serial transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// The device did not answer within the exchange deadline
    #[error("no response from device within {0:?}")]
    Timeout(Duration),

    /// Fewer bytes than a full response arrived before the read timeout
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// The device closed the link mid-exchange
    #[error("link closed by device")]
    Closed,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(TransportError::Io(e))
    }
}

impl From<tokio_serial::Error> for Error {
    fn from(e: tokio_serial::Error) -> Self {
        Error::Transport(TransportError::Serial(e))
    }
}

impl Error {
    /// Short, stable name of the error kind, suitable for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DeviceNotFound => "device_not_found",
            Error::Interrupted => "interrupted",
            Error::Transport(_) => "transport",
            Error::LockRejected(_) => "lock_rejected",
            Error::Config(_) => "config",
        }
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_transport() {
        let err: Error = std::io::Error::other("boom").into();
        assert!(matches!(err, Error::Transport(TransportError::Io(_))));
        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::DeviceNotFound.to_string(), "HSM device not found");
        assert_eq!(
            Error::LockRejected(1).to_string(),
            "device rejected lock request (status 0x01)"
        );
        let short = Error::from(TransportError::ShortRead { expected: 32, actual: 7 });
        assert_eq!(
            short.to_string(),
            "transport error: short read: expected 32 bytes, got 7"
        );
    }
}
