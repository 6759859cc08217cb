//! Error types for vring-blk

use std::time::Duration;

use thiserror::Error;

/// Result type alias using vring-blk Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vring-blk operations
#[derive(Error, Debug)]
pub enum Error {
    /// Bad device path, mapping failure or invalid client configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device lacks a required capability or reports no usable capacity
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Ring size is not a power of two in the supported range
    #[error("Invalid queue capacity {0}: must be a power of two between 1 and 32768")]
    InvalidCapacity(u32),

    /// Not enough free descriptors for the requested chain
    #[error("Queue full: chain needs {needed} descriptors, {free} free")]
    QueueFull { needed: usize, free: usize },

    /// Device completed the request with a non-OK status byte
    #[error("Device I/O error: status {status:#04x}")]
    IoError { status: u8 },

    /// Completion did not arrive within the poll bound
    #[error("Timeout: request head {head} not completed after {elapsed:?}")]
    Timeout { head: u16, elapsed: Duration },

    /// Request was abandoned by a device reset
    #[error("Request resolved by device reset")]
    Reset,

    /// Ring state contradicts the virtqueue protocol (device or memory corruption)
    #[error("Protocol invariant violation: {0}")]
    Protocol(String),

    /// Mapped-memory access errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// Caller request rejected before reaching the ring
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that are fatal at open time and never worth retrying.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::UnsupportedDevice(_) | Error::InvalidCapacity(_)
        )
    }

    /// Only a full queue clears up on its own once completions are reaped.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueueFull { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_class() {
        assert!(Error::Config("bad path".into()).is_config_error());
        assert!(Error::UnsupportedDevice("zero capacity".into()).is_config_error());
        assert!(Error::InvalidCapacity(6).is_config_error());
        assert!(!Error::Reset.is_config_error());
    }

    #[test]
    fn test_only_queue_full_is_retryable() {
        assert!(Error::QueueFull { needed: 2, free: 1 }.is_retryable());
        assert!(!Error::IoError { status: 1 }.is_retryable());
        assert!(!Error::Protocol("dup".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::IoError { status: 2 };
        assert_eq!(err.to_string(), "Device I/O error: status 0x02");
    }
}
