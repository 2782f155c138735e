//! Device session
//!
//! Owns one exchange engine and serializes exchanges against it, so callers
//! on different tasks never interleave packets on the same channel.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::engine::{ExchangeEngine, ExchangeStats};
use super::error::{ExchangeError, ExchangeResult};
use super::ExchangeConfig;
use crate::device::{ChannelBuffer, DeviceTransport};

/// An open session with one device
pub struct Session {
    engine: Mutex<ExchangeEngine>,
    /// Kept outside the lock so a close can interrupt an in-flight read
    buffer: Arc<ChannelBuffer>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(transport: Box<dyn DeviceTransport>, config: ExchangeConfig) -> Self {
        let buffer = transport.buffer();
        Self {
            engine: Mutex::new(ExchangeEngine::new(transport, config)),
            buffer,
            closed: AtomicBool::new(false),
        }
    }

    /// Send one command and wait for its response payload
    ///
    /// Concurrent callers are served one at a time in arrival order.
    pub async fn exchange(&self, command: &[u8]) -> ExchangeResult<Bytes> {
        if self.is_closed() {
            return Err(ExchangeError::Closed);
        }

        let mut engine = self.engine.lock().await;
        if self.is_closed() {
            return Err(ExchangeError::Closed);
        }
        engine.exchange(command).await
    }

    pub async fn stats(&self) -> ExchangeStats {
        self.engine.lock().await.stats().clone()
    }

    /// Transport diagnostics, e.g. for error reports
    pub async fn describe(&self) -> String {
        self.engine.lock().await.transport().describe()
    }

    /// Close the session, failing any exchange still waiting for a response
    pub async fn close(&self) -> ExchangeResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.buffer.close();
        let mut engine = self.engine.lock().await;
        tracing::debug!("Closing session: {}", engine.transport().describe());
        engine.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockTransport;
    use crate::protocol::FrameFormat;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn echo_session() -> (Session, crate::device::MockHandle) {
        let mock = MockTransport::replying(FrameFormat::default(), |command| {
            let mut response = command[5..].to_vec();
            response.extend_from_slice(&[0x90, 0x00]);
            response
        });
        let handle = mock.handle();
        (Session::new(Box::new(mock), ExchangeConfig::default()), handle)
    }

    fn command(data: &[u8]) -> Vec<u8> {
        let mut command = vec![0xe0, 0x04, 0x00, 0x00, data.len() as u8];
        command.extend_from_slice(data);
        command
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_are_serialized() {
        let (session, handle) = echo_session();
        let session = Arc::new(session);

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                let data = vec![i; 100];
                let payload = session.exchange(&command(&data)).await?;
                Ok::<_, ExchangeError>((data, payload))
            }));
        }

        for task in tasks {
            let (data, payload) = assert_ok!(task.await.unwrap());
            assert_eq!(&payload[..], &data[..]);
        }

        // every command was reassembled intact, so no packets interleaved
        assert_eq!(handle.commands().len(), 8);
        assert_eq!(handle.writes(), 16);
        assert_eq!(session.stats().await.exchanges, 8);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_exchange() {
        let mock = MockTransport::new(FrameFormat::default(), |_| Vec::new());
        let handle = mock.handle();
        let config = ExchangeConfig {
            read_timeout: None,
            ..Default::default()
        };
        let session = Arc::new(Session::new(Box::new(mock), config));

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange(&command(&[1, 2, 3])).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ok!(session.close().await);

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("exchange did not observe close")
            .unwrap();
        assert!(matches!(result, Err(ExchangeError::Closed)));
        assert_eq!(handle.closes(), 1);

        // later exchanges fail immediately, repeated closes are no-ops
        assert!(matches!(
            session.exchange(&command(&[1])).await,
            Err(ExchangeError::Closed)
        ));
        assert_ok!(session.close().await);
        assert_eq!(handle.closes(), 1);
        assert!(session.is_closed());
    }
}
