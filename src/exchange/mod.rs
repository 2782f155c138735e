//! Exchange module - Command/response transactions with a device
//!
//! Provides:
//! - The exchange engine (framing, reassembly, status words, glitch recovery)
//! - Sessions serializing exchanges against one device
//! - The error type surfaced by every exchange

mod engine;
mod error;
mod session;

pub use engine::*;
pub use error::*;
pub use session::*;

use bytes::Bytes;
use std::time::Duration;

use crate::protocol::{FrameFormat, PACKET_SIZE};

/// Per-read wait used while collecting a response
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// A report emitted by a known platform defect instead of the real response
///
/// Receiving it in place of a valid packet triggers handle recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlitchSignature(Bytes);

impl GlitchSignature {
    pub fn new(pattern: impl Into<Bytes>) -> Self {
        Self(pattern.into())
    }

    /// The all-zero report
    pub fn zeroed(packet_size: usize) -> Self {
        Self(Bytes::from(vec![0u8; packet_size]))
    }

    pub fn matches(&self, packet: &[u8]) -> bool {
        self.0.as_ref() == packet
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for GlitchSignature {
    fn default() -> Self {
        Self::zeroed(PACKET_SIZE)
    }
}

/// Bounds on automatic glitch recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Glitch count at which a single backoff is inserted before rewriting
    pub backoff_after: u32,
    /// Length of that backoff
    pub backoff: Duration,
    /// Glitch count at which the exchange is abandoned
    pub max_glitches: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            backoff_after: 6,
            backoff: Duration::from_millis(100),
            max_glitches: 10,
        }
    }
}

/// Configuration for an exchange engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// Framing used in both directions
    pub format: FrameFormat,
    /// Wait for each individual report (`None` blocks indefinitely)
    pub read_timeout: Option<Duration>,
    /// Overall wait for a complete response (`None` waits forever)
    pub response_timeout: Option<Duration>,
    /// Report that triggers recovery
    pub glitch_signature: GlitchSignature,
    pub recovery: RecoveryPolicy,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            format: FrameFormat::default(),
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            response_timeout: None,
            glitch_signature: GlitchSignature::default(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl ExchangeConfig {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            glitch_signature: GlitchSignature::zeroed(format.packet_size()),
            ..Default::default()
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn with_glitch_signature(mut self, signature: GlitchSignature) -> Self {
        self.glitch_signature = signature;
        self
    }
}
