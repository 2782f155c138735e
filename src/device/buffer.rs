//! Report accumulator shared between the platform reader and the exchange
//!
//! The producer appends whole reports as they arrive; the consumer polls for
//! a full packet and dequeues it from the head. Only one consumer may call
//! [`ChannelBuffer::read`] at a time. A producer that stops for good records
//! why with [`ChannelBuffer::fail`] so waiting readers do not poll forever.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::traits::{DeviceError, DeviceResult};

/// Interval between checks for a full packet
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Convert a millisecond wait budget into an optional duration
///
/// A non-positive budget means "block indefinitely".
pub fn wait_budget(millis: i64) -> Option<Duration> {
    if millis > 0 {
        Some(Duration::from_millis(millis as u64))
    } else {
        None
    }
}

/// Thread-safe FIFO of received bytes
#[derive(Debug)]
pub struct ChannelBuffer {
    data: Mutex<BytesMut>,
    packet_size: usize,
    closed: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl ChannelBuffer {
    pub fn new(packet_size: usize) -> Self {
        Self {
            data: Mutex::new(BytesMut::with_capacity(packet_size * 8)),
            packet_size,
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    fn lock(&self) -> MutexGuard<'_, BytesMut> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a newly arrived report
    ///
    /// Called from the platform reader; holds the lock only for the copy.
    /// Reports arriving after [`close`](Self::close) are dropped.
    pub fn push(&self, report: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.lock().extend_from_slice(report);
    }

    /// Number of buffered bytes
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    /// Discard all buffered bytes
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Dequeue one packet if a full one is buffered
    pub fn try_read(&self) -> Option<Bytes> {
        let mut data = self.lock();
        if data.len() >= self.packet_size {
            Some(data.split_to(self.packet_size).freeze())
        } else {
            None
        }
    }

    /// Wait for a full packet and dequeue it
    ///
    /// Returns `Ok(None)` if `wait` elapses first; `None` waits forever.
    /// Fails with [`DeviceError::Closed`] once the buffer is closed, and with
    /// [`DeviceError::Disconnected`] once the producer has failed and every
    /// packet it delivered has been consumed.
    pub async fn read(&self, wait: Option<Duration>) -> DeviceResult<Option<Bytes>> {
        let deadline = wait.map(|w| Instant::now() + w);

        loop {
            if self.is_closed() {
                return Err(DeviceError::Closed);
            }

            if let Some(packet) = self.try_read() {
                return Ok(Some(packet));
            }

            if let Some(reason) = self.failure() {
                return Err(DeviceError::Disconnected(reason));
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Make pending and future reads fail promptly
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.clear();
    }

    /// Accept reports again after a close
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record that the producer stopped and will deliver nothing more
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!("Channel buffer failed: {}", reason);
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }

    /// Why the producer stopped, if it did
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget a previous failure once a new producer is running
    pub fn clear_failure(&self) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    #[test]
    fn test_wait_budget() {
        assert_eq!(wait_budget(0), None);
        assert_eq!(wait_budget(-1), None);
        assert_eq!(wait_budget(250), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_fifo_order() {
        let buffer = ChannelBuffer::new(4);
        buffer.push(&[1, 1, 1, 1]);
        buffer.push(&[2, 2, 2, 2, 3, 3]);

        assert_eq!(buffer.try_read().unwrap(), Bytes::from_static(&[1, 1, 1, 1]));
        assert_eq!(buffer.try_read().unwrap(), Bytes::from_static(&[2, 2, 2, 2]));
        // half a packet stays buffered
        assert!(buffer.try_read().is_none());
        assert_eq!(buffer.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let buffer = ChannelBuffer::new(4);
        buffer.push(&[0, 0]);

        let start = Instant::now();
        let result = assert_ok!(buffer.read(Some(Duration::from_millis(20))).await);
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(buffer.available(), 2);
    }

    #[tokio::test]
    async fn test_read_from_producer_thread() {
        let buffer = Arc::new(ChannelBuffer::new(64));
        let producer = buffer.clone();

        let handle = std::thread::spawn(move || {
            for i in 0..3u8 {
                std::thread::sleep(Duration::from_millis(5));
                producer.push(&[i; 64]);
            }
        });

        for i in 0..3u8 {
            let packet = assert_ok!(buffer.read(Some(Duration::from_secs(5))).await);
            assert_eq!(packet.unwrap(), Bytes::from(vec![i; 64]));
        }
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_close_interrupts_read() {
        let buffer = Arc::new(ChannelBuffer::new(64));
        let closer = buffer.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });

        let result = buffer.read(None).await;
        assert!(matches!(result, Err(DeviceError::Closed)));

        // closed buffers drop late reports
        buffer.push(&[0; 64]);
        assert_eq!(buffer.available(), 0);

        buffer.reopen();
        buffer.push(&[0; 64]);
        assert!(buffer.try_read().is_some());
    }

    #[tokio::test]
    async fn test_producer_failure_ends_read() {
        let buffer = Arc::new(ChannelBuffer::new(4));
        let producer = buffer.clone();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.push(&[7, 7, 7, 7]);
            producer.fail("device unplugged");
        });

        // packets delivered before the failure are still handed out
        let packet = assert_ok!(buffer.read(None).await);
        assert_eq!(packet.unwrap(), Bytes::from_static(&[7, 7, 7, 7]));

        match buffer.read(None).await {
            Err(DeviceError::Disconnected(reason)) => assert_eq!(reason, "device unplugged"),
            other => panic!("expected disconnect, got {:?}", other),
        }
        // a timed read fails too instead of reporting "nothing yet"
        assert!(matches!(
            buffer.read(Some(Duration::from_millis(5))).await,
            Err(DeviceError::Disconnected(_))
        ));

        buffer.clear_failure();
        assert!(buffer.failure().is_none());
        let result = assert_ok!(buffer.read(Some(Duration::from_millis(5))).await);
        assert!(result.is_none());
    }
}
