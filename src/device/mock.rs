//! Scripted in-memory device
//!
//! Reassembles written packets the way a device would, hands each complete
//! command to a responder and queues the responder's reports for reading.
//! Useful for exercising exchanges without hardware. Available to the
//! crate's own tests and, with the `mock` feature, to dependents.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::buffer::ChannelBuffer;
use super::traits::{DeviceError, DeviceResult, DeviceTransport};
use crate::protocol::{DecodeOutcome, FrameDecoder, FrameEncoder, FrameFormat};

/// Maps a complete command to the raw reports sent back
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Bytes> + Send>;

#[derive(Debug, Default)]
struct MockState {
    written: Vec<Bytes>,
    commands: Vec<Bytes>,
    resets: u32,
    closes: u32,
    fail_writes: bool,
    fail_resets: bool,
    reply_delay: Option<Duration>,
}

/// Shared view of a [`MockTransport`] for inspection and fault injection
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    buffer: Arc<ChannelBuffer>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of reports written so far
    pub fn writes(&self) -> usize {
        self.lock().written.len()
    }

    /// All reports written so far
    pub fn written(&self) -> Vec<Bytes> {
        self.lock().written.clone()
    }

    /// Commands the device reassembled
    pub fn commands(&self) -> Vec<Bytes> {
        self.lock().commands.clone()
    }

    pub fn resets(&self) -> u32 {
        self.lock().resets
    }

    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    /// Make subsequent writes fail with a broken pipe
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Make subsequent resets fail as if the device vanished
    pub fn set_fail_resets(&self, fail: bool) {
        self.lock().fail_resets = fail;
    }

    /// Deliver replies this long after the command completes (`None` is immediate)
    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        self.lock().reply_delay = delay;
    }

    /// Simulate the device vanishing; pending and later reads fail
    pub fn disconnect(&self) {
        self.buffer.fail("mock device unplugged");
    }
}

/// In-memory device transport
pub struct MockTransport {
    format: FrameFormat,
    decoder: FrameDecoder,
    pending: BytesMut,
    buffer: Arc<ChannelBuffer>,
    responder: Mutex<Responder>,
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

impl MockTransport {
    /// Create a mock whose responder returns raw reports
    pub fn new<F>(format: FrameFormat, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Bytes> + Send + 'static,
    {
        Self {
            format,
            decoder: FrameDecoder::new(format),
            pending: BytesMut::new(),
            buffer: Arc::new(ChannelBuffer::new(format.packet_size())),
            responder: Mutex::new(Box::new(responder)),
            state: Arc::new(Mutex::new(MockState::default())),
            closed: false,
        }
    }

    /// Create a mock whose responder returns a response APDU, framed automatically
    pub fn replying<F>(format: FrameFormat, mut respond: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self::new(format, move |command| frame_reports(format, &respond(command)))
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
            buffer: self.buffer.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn respond(&mut self, command: &[u8]) -> Vec<Bytes> {
        let responder = self
            .responder
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        responder(command)
    }
}

/// Frame a response APDU into reports the way a device sends it
pub fn frame_reports(format: FrameFormat, response: &[u8]) -> Vec<Bytes> {
    match FrameEncoder::new(format).encode(response) {
        Ok(framed) => (0..framed.len())
            .step_by(format.packet_size())
            .map(|start| framed.slice(start..start + format.packet_size()))
            .collect(),
        Err(e) => {
            tracing::warn!("Mock device cannot frame response: {}", e);
            Vec::new()
        }
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn write_report(&mut self, report: &[u8]) -> DeviceResult<usize> {
        if self.closed {
            return Err(DeviceError::Closed);
        }

        {
            let mut state = self.state();
            if state.fail_writes {
                return Err(DeviceError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock write failure",
                )));
            }
            state.written.push(Bytes::copy_from_slice(report));
        }

        self.pending.extend_from_slice(report);
        match self.decoder.reassemble(&self.pending) {
            DecodeOutcome::Complete(command) => {
                self.pending.clear();
                let delay = {
                    let mut state = self.state();
                    state.commands.push(command.clone());
                    state.reply_delay
                };
                let replies = self.respond(&command);
                match delay {
                    Some(delay) => {
                        let buffer = self.buffer.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            for reply in replies {
                                buffer.push(&reply);
                            }
                        });
                    }
                    None => {
                        for reply in replies {
                            self.buffer.push(&reply);
                        }
                    }
                }
            }
            DecodeOutcome::Incomplete => {}
            DecodeOutcome::Malformed(violation) => {
                tracing::warn!("Mock device dropped command: {}", violation);
                self.pending.clear();
            }
        }

        Ok(report.len())
    }

    async fn read_report(&mut self, wait: Option<Duration>) -> DeviceResult<Option<Bytes>> {
        self.buffer.read(wait).await
    }

    async fn close(&mut self) -> DeviceResult<()> {
        self.closed = true;
        self.buffer.close();
        self.state().closes += 1;
        Ok(())
    }

    async fn reset_and_reacquire(&mut self) -> DeviceResult<()> {
        let fail = {
            let mut state = self.state();
            state.resets += 1;
            state.fail_resets
        };

        self.pending.clear();
        self.buffer.clear();

        if fail {
            return Err(DeviceError::DeviceNotFound("mock device vanished".to_string()));
        }
        self.buffer.clear_failure();
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "mock device (channel {:#06x}, {:?} framing, {}-byte reports)",
            self.format.channel(),
            self.format.mode(),
            self.format.packet_size()
        )
    }

    fn buffer(&self) -> Arc<ChannelBuffer> {
        self.buffer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PACKET_SIZE;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_mock_reassembles_and_replies() {
        let format = FrameFormat::default();
        let mut mock = MockTransport::replying(format, |command| {
            let mut response = command.to_vec();
            response.extend_from_slice(&[0x90, 0x00]);
            response
        });
        let handle = mock.handle();

        let framed = FrameEncoder::new(format).encode(&[0xaa; 100]).unwrap();
        for packet in framed.chunks(PACKET_SIZE) {
            assert_ok!(mock.write_report(packet).await);
        }

        assert_eq!(handle.writes(), 2);
        assert_eq!(handle.commands(), vec![Bytes::from(vec![0xaa; 100])]);

        let first = assert_ok!(mock.read_report(Some(Duration::from_millis(10))).await);
        assert_eq!(&first.unwrap()[..7], &[0x01, 0x01, 0x05, 0x00, 0x00, 0x00, 102]);
    }

    #[tokio::test]
    async fn test_mock_fault_injection() {
        let mut mock = MockTransport::new(FrameFormat::default(), |_| Vec::new());
        let handle = mock.handle();

        handle.set_fail_writes(true);
        assert!(mock.write_report(&[0; PACKET_SIZE]).await.is_err());

        handle.set_fail_resets(true);
        assert!(mock.reset_and_reacquire().await.is_err());
        assert_eq!(handle.resets(), 1);

        assert_ok!(mock.close().await);
        assert!(matches!(mock.read_report(None).await, Err(DeviceError::Closed)));
        assert_eq!(handle.closes(), 1);
    }
}
