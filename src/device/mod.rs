//! Device module - Report-level access to hardware signers
//!
//! This module provides:
//! - The transport capability interface the exchange engine depends on
//! - The channel buffer bridging the platform reader and the exchange
//! - Platform backends (Linux hidraw) and, for tests or the `mock` feature,
//!   an in-memory mock device

mod buffer;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod traits;

#[cfg(target_os = "linux")]
mod linux;

// Re-export common types
pub use buffer::*;
#[cfg(any(test, feature = "mock"))]
pub use mock::*;
pub use traits::*;

// Re-export platform-specific implementations
#[cfg(target_os = "linux")]
pub use linux::HidrawTransport;

use crate::discovery::DeviceMatcher;

/// Open the first matching device with the platform backend
#[cfg(target_os = "linux")]
pub fn open_device(
    matcher: &DeviceMatcher,
    packet_size: usize,
) -> DeviceResult<Box<dyn DeviceTransport>> {
    let transport = HidrawTransport::open_matching(matcher.clone(), packet_size)?;
    Ok(Box::new(transport))
}

/// Open the first matching device with the platform backend
#[cfg(not(target_os = "linux"))]
pub fn open_device(
    _matcher: &DeviceMatcher,
    _packet_size: usize,
) -> DeviceResult<Box<dyn DeviceTransport>> {
    Err(DeviceError::NotSupported)
}

/// Get the current platform name
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "macos")]
    return "macOS";

    #[cfg(target_os = "linux")]
    return "Linux (hidraw)";

    #[cfg(target_os = "windows")]
    return "Windows";

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    return "Unknown";
}
