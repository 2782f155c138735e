//! Protocol module - Defines the APDU-over-HID wire protocol
//!
//! Every report on the wire has a fixed size and the following layout:
//! - 2 bytes channel id (big-endian, omitted in BLE framing)
//! - 1 byte tag (always 0x05)
//! - 2 bytes sequence index (big-endian)
//! - 2 bytes total message length (big-endian, first packet only)
//! - Payload, zero-padded to the packet size

mod apdu;
mod codec;
mod hex;
mod status;

pub use apdu::*;
pub use codec::*;
pub use hex::*;
pub use status::*;

/// Size of a single HID report
pub const PACKET_SIZE: usize = 64;

/// Discriminator byte identifying APDU framing
pub const TAG_APDU: u8 = 0x05;

/// Channel used by Ledger devices over USB HID
pub const DEFAULT_CHANNEL: u16 = 0x0101;

/// Selects whether the 2-byte channel field is present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FramingMode {
    /// USB HID framing, channel field present
    #[default]
    Hid,
    /// BLE framing, channel field absent
    Ble,
}

impl FramingMode {
    /// Number of bytes taken by the channel field
    pub fn channel_len(self) -> usize {
        match self {
            FramingMode::Hid => 2,
            FramingMode::Ble => 0,
        }
    }

    /// Header length for the packet at `sequence`
    ///
    /// The first packet additionally carries the total length field.
    pub fn header_len(self, sequence: u16) -> usize {
        let base = self.channel_len() + 1 + 2;
        if sequence == 0 {
            base + 2
        } else {
            base
        }
    }
}

/// Channel, framing mode and packet size shared by both directions of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    channel: u16,
    mode: FramingMode,
    packet_size: usize,
}

impl FrameFormat {
    /// Create a validated frame format
    pub fn new(channel: u16, mode: FramingMode, packet_size: usize) -> CodecResult<Self> {
        if mode == FramingMode::Hid && channel == 0 {
            return Err(CodecError::InvalidChannel(channel));
        }

        // the first packet must carry at least one payload byte
        let minimum = mode.header_len(0) + 1;
        if packet_size < minimum || packet_size > u16::MAX as usize {
            return Err(CodecError::InvalidPacketSize(packet_size, minimum));
        }

        Ok(Self {
            channel,
            mode,
            packet_size,
        })
    }

    /// USB HID framing on the given channel with 64-byte reports
    pub fn hid(channel: u16) -> CodecResult<Self> {
        Self::new(channel, FramingMode::Hid, PACKET_SIZE)
    }

    /// BLE framing with 64-byte reports
    pub fn ble() -> Self {
        Self {
            channel: 0,
            mode: FramingMode::Ble,
            packet_size: PACKET_SIZE,
        }
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL,
            mode: FramingMode::Hid,
            packet_size: PACKET_SIZE,
        }
    }
}
