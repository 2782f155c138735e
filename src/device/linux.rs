//! Linux hidraw transport
//!
//! Reports are written to and read from `/dev/hidrawN`. A reader thread
//! polls the node and appends every incoming report to the channel buffer;
//! it performs no protocol work of its own. If the node goes away the
//! thread marks the buffer failed before exiting.
//!
//! Requirements:
//! - Read/write access to the hidraw node (usually granted by a udev rule
//!   for vendor 2c97)

use async_trait::async_trait;
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::buffer::ChannelBuffer;
use super::traits::{DeviceError, DeviceResult, DeviceTransport};
use crate::discovery::{self, DeviceInfo, DeviceMatcher};

/// How long the reader blocks in poll before rechecking its stop flag (ms)
const READ_POLL_MS: i32 = 50;

/// hidraw expects the report number first; Ledger devices use none
const REPORT_ID: u8 = 0x00;

pub struct HidrawTransport {
    info: DeviceInfo,
    matcher: DeviceMatcher,
    packet_size: usize,
    buffer: Arc<ChannelBuffer>,
    file: Option<Arc<File>>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl HidrawTransport {
    /// Open a specific device; `matcher` is kept for reacquiring it later
    pub fn open(
        info: DeviceInfo,
        matcher: DeviceMatcher,
        packet_size: usize,
    ) -> DeviceResult<Self> {
        let mut transport = Self {
            info,
            matcher,
            packet_size,
            buffer: Arc::new(ChannelBuffer::new(packet_size)),
            file: None,
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
        };
        transport.start()?;
        Ok(transport)
    }

    /// Find and open the first device accepted by `matcher`
    pub fn open_matching(matcher: DeviceMatcher, packet_size: usize) -> DeviceResult<Self> {
        let info = Self::locate(&matcher)?;
        Self::open(info, matcher, packet_size)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn locate(matcher: &DeviceMatcher) -> DeviceResult<DeviceInfo> {
        discovery::find_device(matcher)
            .map_err(|e| DeviceError::Platform(e.to_string()))?
            .ok_or_else(|| {
                DeviceError::DeviceNotFound(format!(
                    "no device with vendor id {:04x} matching {:?}",
                    matcher.vendor_id, matcher.product
                ))
            })
    }

    fn start(&mut self) -> DeviceResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.info.path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied(format!(
                    "cannot open {}; add a udev rule for vendor {:04x}",
                    self.info.path.display(),
                    self.info.vendor_id
                )),
                _ => DeviceError::Io(e),
            })?;
        let file = Arc::new(file);

        self.running.store(true, Ordering::SeqCst);
        self.buffer.clear();
        self.buffer.clear_failure();

        let reader_file = file.clone();
        let buffer = self.buffer.clone();
        let running = self.running.clone();
        let packet_size = self.packet_size;
        let handle = std::thread::Builder::new()
            .name("hidraw-reader".to_string())
            .spawn(move || reader_loop(reader_file, buffer, running, packet_size))?;

        self.file = Some(file);
        self.reader = Some(handle);

        tracing::info!("Opened {}", self.info);
        Ok(())
    }

    /// Signal the reader to stop and release the node
    ///
    /// Returns the reader thread, which exits within one poll interval.
    fn halt(&mut self) -> Option<JoinHandle<()>> {
        self.running.store(false, Ordering::SeqCst);
        self.file = None;
        self.reader.take()
    }

    /// Stop the reader off the async runtime
    async fn stop(&mut self) {
        if let Some(handle) = self.halt() {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::warn!("hidraw reader thread panicked"),
                Err(e) => tracing::warn!("Failed to join hidraw reader: {}", e),
            }
        }
    }
}

/// Poll the device node and append each report to the buffer
fn reader_loop(
    file: Arc<File>,
    buffer: Arc<ChannelBuffer>,
    running: Arc<AtomicBool>,
    packet_size: usize,
) {
    let fd = file.as_raw_fd();
    let mut report = vec![0u8; packet_size];

    while running.load(Ordering::SeqCst) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        let ready = unsafe { libc::poll(&mut pfd, 1, READ_POLL_MS) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::warn!("hidraw poll failed: {}", err);
            buffer.fail(format!("poll failed: {}", err));
            break;
        }
        if ready == 0 {
            continue;
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            tracing::warn!("hidraw device disconnected");
            buffer.fail("device node hung up");
            break;
        }

        report.fill(0);
        match (&*file).read(&mut report) {
            Ok(0) => {}
            Ok(n) => {
                tracing::trace!("Received {} byte report", n);
                buffer.push(&report);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!("hidraw read failed: {}", e);
                buffer.fail(format!("read failed: {}", e));
                break;
            }
        }
    }

    tracing::debug!("hidraw reader stopped");
}

#[async_trait]
impl DeviceTransport for HidrawTransport {
    async fn write_report(&mut self, report: &[u8]) -> DeviceResult<usize> {
        let file = self.file.clone().ok_or(DeviceError::Closed)?;

        let mut out = Vec::with_capacity(report.len() + 1);
        out.push(REPORT_ID);
        out.extend_from_slice(report);
        let expected = out.len();

        let written = tokio::task::spawn_blocking(move || (&*file).write(&out))
            .await
            .map_err(|e| DeviceError::Platform(e.to_string()))??;
        if written == 0 {
            return Err(DeviceError::ShortWrite { written, expected });
        }

        // the report id is not part of the report
        Ok(written - 1)
    }

    async fn read_report(&mut self, wait: Option<Duration>) -> DeviceResult<Option<Bytes>> {
        self.buffer.read(wait).await
    }

    async fn close(&mut self) -> DeviceResult<()> {
        self.stop().await;
        self.buffer.close();
        tracing::info!("Closed {}", self.info.path.display());
        Ok(())
    }

    async fn reset_and_reacquire(&mut self) -> DeviceResult<()> {
        tracing::info!("Reacquiring {}", self.info);
        self.stop().await;
        self.buffer.clear();

        self.info = Self::locate(&self.matcher)?;
        self.start()
    }

    fn describe(&self) -> String {
        let state = if self.file.is_some() { "open" } else { "closed" };
        format!("hidraw {} ({})", self.info, state)
    }

    fn buffer(&self) -> Arc<ChannelBuffer> {
        self.buffer.clone()
    }
}

impl Drop for HidrawTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.halt() {
            if handle.join().is_err() {
                tracing::warn!("hidraw reader thread panicked");
            }
        }
    }
}
