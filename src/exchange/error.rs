//! Exchange errors

use std::time::Duration;
use thiserror::Error;

use crate::device::DeviceError;
use crate::protocol::{ApduError, CodecError, FrameViolation, StatusWord};

/// Errors surfaced by an exchange
///
/// Every variant is fatal for the exchange that produced it; retrying is up
/// to the caller.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Precondition violated: {0}")]
    Precondition(#[from] ApduError),

    #[error("Cannot frame command: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol framing error: {0}")]
    Framing(FrameViolation),

    #[error("Transport error: {source} [{diagnostics}]")]
    Transport {
        source: DeviceError,
        diagnostics: String,
    },

    #[error("Device communication failed after {glitches} glitches [{diagnostics}]")]
    Comms { glitches: u32, diagnostics: String },

    #[error("Device returned status {0}")]
    Device(StatusWord),

    #[error("Response too short for a status word: {0} bytes")]
    ResponseTooShort(usize),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Session closed")]
    Closed,
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Broad category of an [`ExchangeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PreconditionViolation,
    ProtocolFraming,
    TransportIo,
    Comms,
    DeviceStatus,
    Closed,
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Precondition(_) | ExchangeError::Codec(_) => {
                ErrorKind::PreconditionViolation
            }
            ExchangeError::Framing(_) | ExchangeError::ResponseTooShort(_) => {
                ErrorKind::ProtocolFraming
            }
            ExchangeError::Transport { .. } | ExchangeError::Timeout(_) => ErrorKind::TransportIo,
            ExchangeError::Comms { .. } => ErrorKind::Comms,
            ExchangeError::Device(_) => ErrorKind::DeviceStatus,
            ExchangeError::Closed => ErrorKind::Closed,
        }
    }

    /// Status word returned by the device, if that caused the failure
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ExchangeError::Device(status) => Some(status.code()),
            _ => None,
        }
    }

    /// Transport diagnostics captured when the failure happened
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            ExchangeError::Transport { diagnostics, .. }
            | ExchangeError::Comms { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameField;

    #[test]
    fn test_kinds_and_accessors() {
        let err = ExchangeError::Device(StatusWord::UserDenied);
        assert_eq!(err.kind(), ErrorKind::DeviceStatus);
        assert_eq!(err.status_code(), Some(0x6985));
        assert!(err.diagnostics().is_none());

        let err = ExchangeError::Comms {
            glitches: 10,
            diagnostics: "hidraw /dev/hidraw0".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Comms);
        assert_eq!(err.diagnostics(), Some("hidraw /dev/hidraw0"));
        assert!(err.status_code().is_none());

        let err = ExchangeError::Framing(FrameViolation {
            field: FrameField::Tag,
            sequence: 0,
            expected: 5,
            actual: 6,
        });
        assert_eq!(err.kind(), ErrorKind::ProtocolFraming);
        assert_eq!(
            err.to_string(),
            "Protocol framing error: invalid tag in packet 0: expected 0x0005, got 0x0006"
        );
    }
}
