//! Exchange engine
//!
//! Runs one command/response transaction at a time:
//! - Validates and frames the command, then writes every packet
//! - Reads packets until the response reassembles
//! - Recovers the device handle when the known glitch report shows up
//! - Interprets the trailing status word

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use super::error::{ExchangeError, ExchangeResult};
use super::ExchangeConfig;
use crate::device::{DeviceError, DeviceTransport};
use crate::protocol::{
    check_length_prefix, split_status, to_hex, DecodeOutcome, FrameDecoder, FrameEncoder,
};

/// Exchange statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Exchanges started
    pub exchanges: u64,
    /// Packets written
    pub packets_sent: u64,
    /// Packets read
    pub packets_received: u64,
    /// Bytes written
    pub bytes_sent: u64,
    /// Bytes read
    pub bytes_received: u64,
    /// Glitch reports seen
    pub glitches: u64,
    /// Successful handle recoveries
    pub recoveries: u64,
    /// Backoffs inserted before rewriting
    pub backoffs: u64,
}

/// Drives exchanges over a device transport
pub struct ExchangeEngine {
    transport: Box<dyn DeviceTransport>,
    config: ExchangeConfig,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    stats: ExchangeStats,
}

impl ExchangeEngine {
    pub fn new(transport: Box<dyn DeviceTransport>, config: ExchangeConfig) -> Self {
        Self {
            transport,
            encoder: FrameEncoder::new(config.format),
            decoder: FrameDecoder::new(config.format),
            config,
            stats: ExchangeStats::default(),
        }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    pub fn transport(&self) -> &dyn DeviceTransport {
        self.transport.as_ref()
    }

    /// Send a command and return the response payload without its status word
    pub async fn exchange(&mut self, command: &[u8]) -> ExchangeResult<Bytes> {
        check_length_prefix(command)?;

        let framed = self.encoder.encode(command)?;
        debug_assert_eq!(framed.len() % self.config.format.packet_size(), 0);

        self.discard_stale();

        self.stats.exchanges += 1;
        tracing::debug!(
            "=> {} ({} packets)",
            to_hex(command),
            framed.len() / self.config.format.packet_size()
        );

        self.write_all(&framed).await?;
        let response = self.read_response(&framed).await?;
        tracing::debug!("<= {}", to_hex(&response));

        Self::interpret(response)
    }

    /// Close the underlying transport
    pub async fn close(&mut self) -> ExchangeResult<()> {
        self.transport
            .close()
            .await
            .map_err(|e| self.transport_error(e))
    }

    /// Drop anything left over from an earlier exchange
    ///
    /// A reply arriving after a timeout, or packets trailing a framing error,
    /// must never be taken for the response to the next command.
    fn discard_stale(&self) {
        let buffer = self.transport.buffer();
        let stale = buffer.available();
        if stale > 0 {
            tracing::debug!("Discarding {} stale bytes", stale);
            buffer.clear();
        }
    }

    async fn write_all(&mut self, framed: &Bytes) -> ExchangeResult<()> {
        for packet in framed.chunks(self.config.format.packet_size()) {
            let written = match self.transport.write_report(packet).await {
                Ok(written) => written,
                Err(e) => return Err(self.transport_error(e)),
            };

            if written != packet.len() {
                return Err(self.transport_error(DeviceError::ShortWrite {
                    written,
                    expected: packet.len(),
                }));
            }

            self.stats.packets_sent += 1;
            self.stats.bytes_sent += written as u64;
        }
        Ok(())
    }

    async fn read_response(&mut self, framed: &Bytes) -> ExchangeResult<Bytes> {
        let started = Instant::now();
        let mut raw = BytesMut::new();
        let mut glitches: u32 = 0;

        loop {
            let packet = match self.transport.read_report(self.config.read_timeout).await {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    if let Some(limit) = self.config.response_timeout {
                        if started.elapsed() >= limit {
                            return Err(ExchangeError::Timeout(limit));
                        }
                    }
                    tracing::trace!("Still waiting for response ({:?})", started.elapsed());
                    continue;
                }
                Err(e) => return Err(self.transport_error(e)),
            };

            self.stats.packets_received += 1;
            self.stats.bytes_received += packet.len() as u64;
            raw.extend_from_slice(&packet);

            match self.decoder.reassemble(&raw) {
                DecodeOutcome::Complete(response) => return Ok(response),
                DecodeOutcome::Incomplete => continue,
                DecodeOutcome::Malformed(violation) => {
                    if !self.config.glitch_signature.matches(&packet) {
                        tracing::warn!("Malformed response: {}", violation);
                        return Err(ExchangeError::Framing(violation));
                    }

                    glitches += 1;
                    self.recover(glitches, framed).await?;
                    raw.clear();
                }
            }
        }
    }

    /// Reacquire the device and resend the command after a glitch report
    async fn recover(&mut self, glitches: u32, framed: &Bytes) -> ExchangeResult<()> {
        let policy = self.config.recovery;
        self.stats.glitches += 1;
        tracing::warn!("Glitch report received ({}/{})", glitches, policy.max_glitches);

        if glitches >= policy.max_glitches {
            return Err(ExchangeError::Comms {
                glitches,
                diagnostics: self.transport.describe(),
            });
        }

        if let Err(e) = self.transport.reset_and_reacquire().await {
            return Err(self.transport_error(e));
        }
        self.stats.recoveries += 1;

        if glitches == policy.backoff_after {
            tracing::info!("Backing off for {:?} before resending", policy.backoff);
            self.stats.backoffs += 1;
            tokio::time::sleep(policy.backoff).await;
        }

        self.write_all(framed).await
    }

    /// Strip the status word, mapping anything but success to an error
    fn interpret(response: Bytes) -> ExchangeResult<Bytes> {
        let (payload_len, status) = match split_status(&response) {
            Some((payload, status)) => (payload.len(), status),
            None => return Err(ExchangeError::ResponseTooShort(response.len())),
        };

        if status.is_ok() {
            Ok(response.slice(..payload_len))
        } else {
            Err(ExchangeError::Device(status))
        }
    }

    fn transport_error(&self, source: DeviceError) -> ExchangeError {
        match source {
            DeviceError::Closed => ExchangeError::Closed,
            source => ExchangeError::Transport {
                source,
                diagnostics: self.transport.describe(),
            },
        }
    }
}
