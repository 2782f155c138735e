//! Device discovery module
//!
//! Finds hardware signers among the HID devices attached to this host. On
//! Linux the `hidraw` class in sysfs is scanned; each node exposes a
//! `uevent` file with the vendor/product ids and name, and the raw report
//! descriptor from which the usage page is read.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ledger's USB vendor id
pub const LEDGER_VENDOR_ID: u16 = 0x2c97;

/// Usage page of the generic (non-FIDO) Ledger interface
pub const LEDGER_USAGE_PAGE: u16 = 0xffa0;

/// Product name reported by the Nano S
pub const LEDGER_PRODUCT: &str = "Nano S";

/// Where the kernel lists hidraw nodes
pub const SYSFS_HIDRAW: &str = "/sys/class/hidraw";

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not supported on this platform")]
    NotSupported,
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Information about an attached HID device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Device node used to open the device
    pub path: PathBuf,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Product name as reported by the kernel
    pub product: String,
    /// First usage page of the report descriptor, if readable
    pub usage_page: Option<u16>,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}] {}",
            self.path.display(),
            self.vendor_id,
            self.product_id,
            self.product
        )?;
        if let Some(page) = self.usage_page {
            write!(f, " (usage page {:#06x})", page)?;
        }
        Ok(())
    }
}

/// Criteria for selecting a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMatcher {
    pub vendor_id: u16,
    /// Case-insensitive substring of the product name
    pub product: Option<String>,
    /// Required usage page; devices with an unknown usage page still match
    pub usage_page: Option<u16>,
}

impl Default for DeviceMatcher {
    fn default() -> Self {
        Self {
            vendor_id: LEDGER_VENDOR_ID,
            product: Some(LEDGER_PRODUCT.to_string()),
            usage_page: Some(LEDGER_USAGE_PAGE),
        }
    }
}

impl DeviceMatcher {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        if info.vendor_id != self.vendor_id {
            return false;
        }

        if let Some(product) = &self.product {
            if !info.product.to_lowercase().contains(&product.to_lowercase()) {
                return false;
            }
        }

        match (self.usage_page, info.usage_page) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }
}

/// List all HID devices on this host
#[cfg(target_os = "linux")]
pub fn enumerate() -> DiscoveryResult<Vec<DeviceInfo>> {
    enumerate_sysfs(Path::new(SYSFS_HIDRAW), Path::new("/dev"))
}

/// List all HID devices on this host
#[cfg(not(target_os = "linux"))]
pub fn enumerate() -> DiscoveryResult<Vec<DeviceInfo>> {
    Err(DiscoveryError::NotSupported)
}

/// Find the first device accepted by `matcher`
pub fn find_device(matcher: &DeviceMatcher) -> DiscoveryResult<Option<DeviceInfo>> {
    let found = enumerate()?.into_iter().find(|info| matcher.matches(info));
    match &found {
        Some(info) => tracing::debug!("Found device: {}", info),
        None => tracing::debug!("No device matches {:?}", matcher),
    }
    Ok(found)
}

/// Scan a sysfs hidraw class directory
///
/// Device nodes are assumed to live in `dev_dir` under the same name.
pub fn enumerate_sysfs(root: &Path, dev_dir: &Path) -> DiscoveryResult<Vec<DeviceInfo>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut devices = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let device_dir = entry.path().join("device");

        let uevent = match std::fs::read_to_string(device_dir.join("uevent")) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };

        let Some((vendor_id, product_id, product)) = parse_uevent(&uevent) else {
            tracing::debug!("Skipping {}: no HID_ID", entry.path().display());
            continue;
        };

        let usage_page = std::fs::read(device_dir.join("report_descriptor"))
            .ok()
            .and_then(|descriptor| usage_page(&descriptor));

        devices.push(DeviceInfo {
            path: dev_dir.join(&name),
            vendor_id,
            product_id,
            product,
            usage_page,
        });
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// Extract vendor id, product id and name from a hid uevent file
///
/// `HID_ID` has the form `BBBB:VVVVVVVV:PPPPPPPP` in hex.
fn parse_uevent(contents: &str) -> Option<(u16, u16, String)> {
    let mut ids = None;
    let mut name = String::new();

    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("HID_ID=") {
            let mut parts = value.trim().split(':');
            let _bus = parts.next()?;
            let vendor = u32::from_str_radix(parts.next()?, 16).ok()?;
            let product = u32::from_str_radix(parts.next()?, 16).ok()?;
            ids = Some((vendor as u16, product as u16));
        } else if let Some(value) = line.strip_prefix("HID_NAME=") {
            name = value.trim().to_string();
        }
    }

    ids.map(|(vendor, product)| (vendor, product, name))
}

/// Read the first Usage Page item from a HID report descriptor
pub fn usage_page(descriptor: &[u8]) -> Option<u16> {
    const LONG_ITEM: u8 = 0xfe;
    const USAGE_PAGE_TAG: u8 = 0x04;

    let mut i = 0;
    while i < descriptor.len() {
        let prefix = descriptor[i];

        if prefix == LONG_ITEM {
            let size = *descriptor.get(i + 1)? as usize;
            i += 3 + size;
            continue;
        }

        let size = match prefix & 0x03 {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 4,
        };
        let data = descriptor.get(i + 1..i + 1 + size)?;

        if prefix & 0xfc == USAGE_PAGE_TAG {
            let value = data
                .iter()
                .rev()
                .fold(0u32, |acc, byte| (acc << 8) | *byte as u32);
            return Some(value as u16);
        }

        i += 1 + size;
    }

    None
}
