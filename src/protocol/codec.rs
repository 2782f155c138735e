//! Protocol codec for framing and reassembling APDUs
//!
//! Commands are split into fixed-size packets by [`FrameEncoder`]. Responses
//! are reassembled by [`FrameDecoder`], which re-parses the accumulated raw
//! bytes on every call and reports one of three outcomes: complete,
//! incomplete (more packets needed) or malformed.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use super::{FrameFormat, TAG_APDU};

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid channel: {0:#06x}")]
    InvalidChannel(u16),

    #[error("Invalid packet size: {0} bytes (min: {1})")]
    InvalidPacketSize(usize, usize),

    #[error("Command too long: {0} bytes (max: {1})")]
    CommandTooLong(usize, usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Header field that failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameField {
    Channel,
    Tag,
    Sequence,
}

impl fmt::Display for FrameField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameField::Channel => "channel",
            FrameField::Tag => "tag",
            FrameField::Sequence => "sequence index",
        };
        f.write_str(name)
    }
}

/// A header mismatch found while decoding a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameViolation {
    pub field: FrameField,
    pub sequence: u16,
    pub expected: u16,
    pub actual: u16,
}

impl fmt::Display for FrameViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid {} in packet {}: expected {:#06x}, got {:#06x}",
            self.field, self.sequence, self.expected, self.actual
        )
    }
}

/// Result of decoding from a partially received byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome<T> {
    /// Enough data was present and every header was valid
    Complete(T),
    /// More packets are needed before a decision can be made
    Incomplete,
    /// A header field did not match; the stream is desynchronized
    Malformed(FrameViolation),
}

impl<T> DecodeOutcome<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, DecodeOutcome::Complete(_))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeOutcome::Incomplete)
    }
}

/// One decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    /// Payload bytes following the header (including any zero padding)
    pub fragment: Bytes,
    /// Declared total length, only non-zero on the first packet
    pub total_length: usize,
}

/// Splits commands into fixed-size packets
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    format: FrameFormat,
}

impl FrameEncoder {
    pub fn new(format: FrameFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    /// Encode a command into a buffer of whole packets
    ///
    /// An empty command produces no packets at all.
    pub fn encode(&self, command: &[u8]) -> CodecResult<Bytes> {
        let max = u16::MAX as usize;
        if command.len() > max {
            return Err(CodecError::CommandTooLong(command.len(), max));
        }

        let packet_size = self.format.packet_size();
        let mut buf = BytesMut::with_capacity(self.packet_count(command.len()) * packet_size);
        let mut offset = 0;
        let mut sequence: u16 = 0;

        while offset < command.len() {
            let start = buf.len();

            // Write header
            if self.format.mode().channel_len() > 0 {
                buf.put_u16(self.format.channel());
            }
            buf.put_u8(TAG_APDU);
            buf.put_u16(sequence);
            if sequence == 0 {
                buf.put_u16(command.len() as u16);
            }

            // Write as much payload as the packet holds
            let space = packet_size - (buf.len() - start);
            let capacity = space.min(command.len() - offset);
            buf.put_slice(&command[offset..offset + capacity]);

            // Zero-pad the last packet
            buf.put_bytes(0, packet_size - (buf.len() - start));

            offset += capacity;
            sequence = sequence.wrapping_add(1);
        }

        Ok(buf.freeze())
    }

    /// Number of packets needed for a command of `len` bytes
    pub fn packet_count(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }

        let mode = self.format.mode();
        let first = self.format.packet_size() - mode.header_len(0);
        if len <= first {
            return 1;
        }

        let rest = self.format.packet_size() - mode.header_len(1);
        1 + (len - first).div_ceil(rest)
    }
}

/// Parses packets and reassembles messages
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    format: FrameFormat,
}

impl FrameDecoder {
    pub fn new(format: FrameFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    /// Decode the packet with index `sequence` from the accumulated bytes
    pub fn decode_packet(&self, raw: &[u8], sequence: u16) -> DecodeOutcome<DecodedPacket> {
        let packet_size = self.format.packet_size();
        let mode = self.format.mode();
        let start = sequence as usize * packet_size;

        if raw.len() < start + mode.header_len(sequence) {
            return DecodeOutcome::Incomplete;
        }

        let end = raw.len().min(start + packet_size);
        let window = &raw[start..end];
        let mut pos = 0;

        if mode.channel_len() > 0 {
            let channel = u16::from_be_bytes([window[0], window[1]]);
            if channel != self.format.channel() {
                return DecodeOutcome::Malformed(FrameViolation {
                    field: FrameField::Channel,
                    sequence,
                    expected: self.format.channel(),
                    actual: channel,
                });
            }
            pos += 2;
        }

        let tag = window[pos];
        if tag != TAG_APDU {
            return DecodeOutcome::Malformed(FrameViolation {
                field: FrameField::Tag,
                sequence,
                expected: TAG_APDU as u16,
                actual: tag as u16,
            });
        }
        pos += 1;

        let decoded_sequence = u16::from_be_bytes([window[pos], window[pos + 1]]);
        if decoded_sequence != sequence {
            return DecodeOutcome::Malformed(FrameViolation {
                field: FrameField::Sequence,
                sequence,
                expected: sequence,
                actual: decoded_sequence,
            });
        }
        pos += 2;

        let mut total_length = 0;
        if sequence == 0 {
            total_length = u16::from_be_bytes([window[pos], window[pos + 1]]) as usize;
            pos += 2;
        }

        DecodeOutcome::Complete(DecodedPacket {
            fragment: Bytes::copy_from_slice(&window[pos..]),
            total_length,
        })
    }

    /// Attempt to reassemble a full message from the accumulated bytes
    ///
    /// The output is the concatenation of packet fragments truncated to the
    /// total length declared by the first packet.
    pub fn reassemble(&self, raw: &[u8]) -> DecodeOutcome<Bytes> {
        let first = match self.decode_packet(raw, 0) {
            DecodeOutcome::Complete(packet) => packet,
            DecodeOutcome::Incomplete => return DecodeOutcome::Incomplete,
            DecodeOutcome::Malformed(violation) => return DecodeOutcome::Malformed(violation),
        };

        let total = first.total_length;
        let mut output = BytesMut::with_capacity(total);
        let mut fragment = first.fragment;
        let mut sequence: u16 = 0;

        loop {
            let take = fragment.len().min(total - output.len());
            output.put_slice(&fragment[..take]);

            if output.len() == total {
                return DecodeOutcome::Complete(output.freeze());
            }

            sequence = match sequence.checked_add(1) {
                Some(next) => next,
                None => return DecodeOutcome::Incomplete,
            };

            fragment = match self.decode_packet(raw, sequence) {
                DecodeOutcome::Complete(packet) => packet.fragment,
                DecodeOutcome::Incomplete => return DecodeOutcome::Incomplete,
                DecodeOutcome::Malformed(violation) => {
                    return DecodeOutcome::Malformed(violation)
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{from_hex, FramingMode, DEFAULT_CHANNEL, PACKET_SIZE};

    fn command(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    fn hid() -> FrameFormat {
        FrameFormat::hid(DEFAULT_CHANNEL).unwrap()
    }

    #[test]
    fn test_encode_200_byte_command() {
        let encoder = FrameEncoder::new(hid());
        let cmd = command(200);

        let out = encoder.encode(&cmd).unwrap();
        assert_eq!(out.len(), 256);
        assert_eq!(encoder.packet_count(cmd.len()), 4);

        // channel, tag, sequence, total length
        assert_eq!(&out[..7], &[0x01, 0x01, 0x05, 0x00, 0x00, 0x00, 0xc8]);
        assert_eq!(&out[7..64], &cmd[..57]);

        // continuation packets lose the length field
        assert_eq!(&out[64..69], &[0x01, 0x01, 0x05, 0x00, 0x01]);
        assert_eq!(&out[69..128], &cmd[57..116]);
    }

    #[test]
    fn test_encode_empty_command() {
        let encoder = FrameEncoder::new(hid());
        let out = encoder.encode(&[]).unwrap();
        assert!(out.is_empty());
        assert_eq!(encoder.packet_count(0), 0);
    }

    #[test]
    fn test_encode_pads_last_packet() {
        let encoder = FrameEncoder::new(hid());
        let out = encoder.encode(&[0xaa; 3]).unwrap();
        assert_eq!(out.len(), PACKET_SIZE);
        assert_eq!(&out[7..10], &[0xaa; 3]);
        assert!(out[10..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_encode_too_long() {
        let encoder = FrameEncoder::new(hid());
        let err = encoder.encode(&vec![0; 70_000]).unwrap_err();
        assert_eq!(err, CodecError::CommandTooLong(70_000, 65_535));
    }

    #[test]
    fn test_golden_public_key_frame() {
        let apdu = from_hex("e002000015058000002c800001a9800000008000000080000000").unwrap();
        let mut expected =
            from_hex("0101050000001ae002000015058000002c800001a9800000008000000080000000")
                .unwrap();
        expected.resize(PACKET_SIZE, 0);

        let out = FrameEncoder::new(hid()).encode(&apdu).unwrap();
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn test_ble_offsets() {
        let format = FrameFormat::ble();
        let cmd = command(100);
        let out = FrameEncoder::new(format).encode(&cmd).unwrap();

        assert_eq!(&out[..5], &[0x05, 0x00, 0x00, 0x00, 0x64]);
        assert_eq!(&out[5..64], &cmd[..59]);
        assert_eq!(&out[64..67], &[0x05, 0x00, 0x01]);
        assert_eq!(&out[67..108], &cmd[59..]);
    }

    #[test]
    fn test_roundtrip_lengths_and_sizes() {
        for mode in [FramingMode::Hid, FramingMode::Ble] {
            for packet_size in [8, 16, 64, 65] {
                let format = FrameFormat::new(0x0101, mode, packet_size).unwrap();
                let encoder = FrameEncoder::new(format);
                let decoder = FrameDecoder::new(format);

                for len in [1, 2, 57, 58, 59, 200, 1000] {
                    let cmd = command(len);
                    let framed = encoder.encode(&cmd).unwrap();
                    assert_eq!(framed.len() % packet_size, 0);
                    assert_eq!(framed.len() / packet_size, encoder.packet_count(len));

                    match decoder.reassemble(&framed) {
                        DecodeOutcome::Complete(out) => assert_eq!(&out[..], &cmd[..]),
                        other => panic!("expected complete, got {:?}", other),
                    }
                }
            }
        }
    }

    #[test]
    fn test_decode_first_packet() {
        let format = hid();
        let framed = FrameEncoder::new(format).encode(&command(10)).unwrap();

        match FrameDecoder::new(format).decode_packet(&framed, 0) {
            DecodeOutcome::Complete(packet) => {
                assert_eq!(packet.total_length, 10);
                assert_eq!(packet.fragment.len(), PACKET_SIZE - 7);
                assert_eq!(&packet.fragment[..10], &command(10)[..]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_short_header_is_incomplete() {
        let decoder = FrameDecoder::new(hid());
        assert!(decoder.decode_packet(&[0x01, 0x01, 0x05, 0x00, 0x00, 0x00], 0).is_incomplete());
        assert!(decoder.reassemble(&[]).is_incomplete());

        // BLE headers are two bytes shorter
        let ble = FrameDecoder::new(FrameFormat::ble());
        assert!(ble.decode_packet(&[0x05, 0x00, 0x00, 0x00, 0x01], 0).is_complete());
        assert!(ble.decode_packet(&[0x05, 0x00, 0x00, 0x00], 0).is_incomplete());
    }

    #[test]
    fn test_sequence_rejected() {
        let format = hid();
        let mut framed = FrameEncoder::new(format).encode(&command(200)).unwrap().to_vec();
        // second packet claims to be sequence 2
        framed[64 + 4] = 0x02;

        let decoder = FrameDecoder::new(format);
        match decoder.decode_packet(&framed, 1) {
            DecodeOutcome::Malformed(violation) => {
                assert_eq!(violation.field, FrameField::Sequence);
                assert_eq!(violation.expected, 1);
                assert_eq!(violation.actual, 2);
            }
            other => panic!("expected malformed, got {:?}", other),
        }
        assert!(matches!(decoder.reassemble(&framed), DecodeOutcome::Malformed(_)));
    }

    #[test]
    fn test_channel_and_tag_rejected() {
        let format = hid();
        let framed = FrameEncoder::new(format).encode(&command(5)).unwrap();
        let decoder = FrameDecoder::new(format);

        let mut wrong_channel = framed.to_vec();
        wrong_channel[1] = 0x02;
        match decoder.reassemble(&wrong_channel) {
            DecodeOutcome::Malformed(v) => {
                assert_eq!(v.field, FrameField::Channel);
                assert_eq!(v.actual, 0x0102);
            }
            other => panic!("expected malformed, got {:?}", other),
        }

        let mut wrong_tag = framed.to_vec();
        wrong_tag[2] = 0x06;
        match decoder.reassemble(&wrong_tag) {
            DecodeOutcome::Malformed(v) => assert_eq!(v.field, FrameField::Tag),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_then_complete() {
        let format = hid();
        let response = command(150);
        let framed = FrameEncoder::new(format).encode(&response).unwrap();
        let decoder = FrameDecoder::new(format);

        let mut raw = Vec::new();
        for (i, packet) in framed.chunks(PACKET_SIZE).enumerate() {
            raw.extend_from_slice(packet);
            let outcome = decoder.reassemble(&raw);
            if i < 2 {
                assert!(outcome.is_incomplete(), "packet {} should be incomplete", i);
            } else {
                assert_eq!(outcome, DecodeOutcome::Complete(Bytes::from(response.clone())));
            }
        }
    }

    #[test]
    fn test_reassemble_truncates_padding() {
        let format = hid();
        let decoder = FrameDecoder::new(format);
        let mut packet = vec![0u8; PACKET_SIZE];
        packet[..7].copy_from_slice(&[0x01, 0x01, 0x05, 0x00, 0x00, 0x00, 0x02]);
        packet[7] = 0x90;
        packet[8] = 0x00;
        packet[9] = 0xff;

        assert_eq!(
            decoder.reassemble(&packet),
            DecodeOutcome::Complete(Bytes::from_static(&[0x90, 0x00]))
        );
    }

    #[test]
    fn test_reassemble_zero_length() {
        let decoder = FrameDecoder::new(hid());
        let mut packet = vec![0u8; PACKET_SIZE];
        packet[..3].copy_from_slice(&[0x01, 0x01, 0x05]);
        assert_eq!(decoder.reassemble(&packet), DecodeOutcome::Complete(Bytes::new()));
    }
}
