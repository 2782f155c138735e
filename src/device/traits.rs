//! Device transport trait definitions
//!
//! Defines the common interface that platform-specific backends must provide.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::buffer::ChannelBuffer;

/// Errors that can occur during device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Not supported on this platform")]
    NotSupported,

    #[error("Device closed")]
    Closed,

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Report-level access to a hardware signer
///
/// Incoming reports are delivered by the backend into a [`ChannelBuffer`];
/// `read_report` dequeues from it. Implementations are driven by one
/// exchange at a time.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Write one report, returning the number of bytes written
    async fn write_report(&mut self, report: &[u8]) -> DeviceResult<usize>;

    /// Read one report, waiting at most `wait` (`None` blocks indefinitely)
    ///
    /// Returns `Ok(None)` if the wait elapsed without a full report.
    async fn read_report(&mut self, wait: Option<Duration>) -> DeviceResult<Option<Bytes>>;

    /// Close the underlying handle
    async fn close(&mut self) -> DeviceResult<()>;

    /// Drop the handle, rescan for the same device and reopen it
    async fn reset_and_reacquire(&mut self) -> DeviceResult<()>;

    /// Diagnostic description of the device
    fn describe(&self) -> String;

    /// Buffer that incoming reports are delivered into
    fn buffer(&self) -> Arc<ChannelBuffer>;
}
