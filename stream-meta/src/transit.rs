//! # Inter-Core Wire Format
//!
//! Message definitions for the metadata traffic between the two cores.
//! Payloads are serialized with `postcard`; frames add magic bytes, a
//! sequence number, a length field and a CRC so the mailbox driver can
//! validate what it delivers.
//!
//! ## Frame Format
//!
//! ```text
//! ┌─────────┬──────────┬─────────┬────────┬──────────────────┬──────────┐
//! │  Magic  │ Sequence │ Length  │  Kind  │     Payload      │   CRC    │
//! │ 4 bytes │  2 bytes │ 2 bytes │ 1 byte │  Variable size   │  2 bytes │
//! └─────────┴──────────┴─────────┴────────┴──────────────────┴──────────┘
//! ```
//!
//! ## Message Types
//!
//! - **Tag**: a stream tag departing for the peer core, attachments included
//! - **Retired**: a deletion notice closing one cross-core EOS lineage

use serde::{Deserialize, Serialize};

use crate::attachment::AttachmentBlock;
use crate::eos::EosToken;
use crate::tag::TagFlags;
use crate::CoreId;

/// Magic bytes identifying a metadata frame
pub const FRAME_MAGIC: [u8; 4] = [0xA5, 0x4D, 0x54, 0x41]; // "MTA"

/// Octets of framing around the payload: magic, sequence, length, kind, CRC
pub const FRAME_OVERHEAD: usize = 11;

/// A stream tag in transit between cores.
///
/// The octet index is buffer-local and is reassigned when the tag is
/// appended on the far side, so it does not travel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTag {
    /// Octets of data the tag covers
    pub length: u32,
    /// Flag bits
    pub flags: TagFlags,
    /// The tag's attachment block, handles already rewritten for transit
    pub attachments: AttachmentBlock,
}

/// One cross-core EOS lineage has fully drained on the sending core.
///
/// Fire-and-forget: there is no acknowledgment and no retry. The carrier
/// is trusted to deliver in order, losslessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeletionNotice {
    /// Core holding the event's registry entry
    pub origin: CoreId,
    /// The entry the notice refers to
    pub token: EosToken,
}

/// Message kinds for the metadata link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageKind {
    /// Tag transfer
    Tag = 0x01,
    /// Deletion notice
    Retired = 0x02,
}

impl TryFrom<u8> for MessageKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Tag),
            0x02 => Ok(Self::Retired),
            _ => Err(()),
        }
    }
}

/// Complete message enum for the metadata link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMessage {
    /// A stream tag departing for the peer core
    Tag(WireTag),
    /// A deletion notice closing one cross-core lineage
    Retired(DeletionNotice),
}

impl LinkMessage {
    /// Serialize the message into `buffer` using postcard.
    pub fn serialize<'a>(&self, buffer: &'a mut [u8]) -> Result<&'a [u8], postcard::Error> {
        let used = postcard::to_slice(self, buffer)?;
        Ok(used)
    }

    /// Deserialize a message from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    /// The message kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            LinkMessage::Tag(_) => MessageKind::Tag,
            LinkMessage::Retired(_) => MessageKind::Retired,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameHeader {
    /// Monotonic frame sequence, wraps at `u16::MAX`
    pub sequence: u16,
    /// Payload length in octets
    pub payload_len: u16,
    /// Message kind byte
    pub kind: MessageKind,
}

/// Errors during frame building/parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Buffer too small for the frame
    BufferTooSmall,
    /// Frame data too short
    TooShort,
    /// Invalid magic bytes
    InvalidMagic,
    /// Unknown message kind byte
    UnknownKind,
    /// CRC check failed
    CrcMismatch,
    /// Serialization failed
    SerializationError,
    /// Deserialization failed
    DeserializationError,
}

/// Builds and parses metadata frames.
pub struct FrameCodec {
    sequence: u16,
}

impl FrameCodec {
    /// A codec starting at sequence zero.
    pub const fn new() -> Self {
        FrameCodec { sequence: 0 }
    }

    /// Get the next sequence number and increment.
    pub fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    /// Build a complete frame into `buffer`.
    ///
    /// Returns the number of bytes written.
    pub fn encode(&mut self, msg: &LinkMessage, buffer: &mut [u8]) -> Result<usize, FrameError> {
        if buffer.len() < FRAME_OVERHEAD {
            return Err(FrameError::BufferTooSmall);
        }

        // Write magic
        buffer[0..4].copy_from_slice(&FRAME_MAGIC);

        // Serialize payload past the header space, leaving room for the CRC
        let payload_start = 9;
        let crc_reserve = buffer.len() - 2;
        let payload = msg
            .serialize(&mut buffer[payload_start..crc_reserve])
            .map_err(|_| FrameError::SerializationError)?;
        let payload_len = payload.len();

        // Write header
        let sequence = self.next_sequence();
        buffer[4..6].copy_from_slice(&sequence.to_le_bytes());
        buffer[6..8].copy_from_slice(&(payload_len as u16).to_le_bytes());
        buffer[8] = msg.kind() as u8;

        // CRC over everything except the CRC field itself
        let crc_data_len = payload_start + payload_len;
        let crc = crc16(&buffer[..crc_data_len]);
        buffer[crc_data_len..crc_data_len + 2].copy_from_slice(&crc.to_le_bytes());

        Ok(crc_data_len + 2)
    }

    /// Parse a frame from bytes.
    pub fn parse(data: &[u8]) -> Result<(FrameHeader, LinkMessage), FrameError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(FrameError::TooShort);
        }

        // Check magic
        if data[0..4] != FRAME_MAGIC {
            return Err(FrameError::InvalidMagic);
        }

        // Parse header
        let sequence = u16::from_le_bytes([data[4], data[5]]);
        let payload_len = u16::from_le_bytes([data[6], data[7]]) as usize;
        let kind = MessageKind::try_from(data[8]).map_err(|_| FrameError::UnknownKind)?;

        // Verify length
        let expected_len = FRAME_OVERHEAD + payload_len;
        if data.len() < expected_len {
            return Err(FrameError::TooShort);
        }

        // Verify CRC
        let crc_expected = u16::from_le_bytes([data[expected_len - 2], data[expected_len - 1]]);
        let crc_actual = crc16(&data[..expected_len - 2]);
        if crc_expected != crc_actual {
            return Err(FrameError::CrcMismatch);
        }

        // Parse payload
        let payload = &data[9..9 + payload_len];
        let message =
            LinkMessage::deserialize(payload).map_err(|_| FrameError::DeserializationError)?;

        let header = FrameHeader {
            sequence,
            payload_len: payload_len as u16,
            kind,
        };
        Ok((header, message))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-16-CCITT
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_FRAME_SIZE;

    fn sample_notice() -> DeletionNotice {
        DeletionNotice {
            origin: CoreId::P0,
            token: EosToken::test_token(3, 1),
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = LinkMessage::Retired(sample_notice());
        let mut buffer = [0u8; MAX_FRAME_SIZE];

        let serialized = msg.serialize(&mut buffer).unwrap();
        let deserialized = LinkMessage::deserialize(serialized).unwrap();

        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let msg = LinkMessage::Tag(WireTag {
            length: 512,
            flags: TagFlags::STREAM_END,
            attachments: AttachmentBlock::new(),
        });

        let mut buffer = [0u8; MAX_FRAME_SIZE];
        let len = codec.encode(&msg, &mut buffer).unwrap();

        let (header, parsed) = FrameCodec::parse(&buffer[..len]).unwrap();
        assert_eq!(header.sequence, 0);
        assert_eq!(header.kind, MessageKind::Tag);
        assert_eq!(msg, parsed);
    }

    #[test]
    fn test_sequence_advances() {
        let mut codec = FrameCodec::new();
        let msg = LinkMessage::Retired(sample_notice());
        let mut buffer = [0u8; MAX_FRAME_SIZE];

        codec.encode(&msg, &mut buffer).unwrap();
        let len = codec.encode(&msg, &mut buffer).unwrap();
        let (header, _) = FrameCodec::parse(&buffer[..len]).unwrap();
        assert_eq!(header.sequence, 1);
    }

    #[test]
    fn test_crc_verification() {
        let mut codec = FrameCodec::new();
        let msg = LinkMessage::Retired(sample_notice());

        let mut buffer = [0u8; MAX_FRAME_SIZE];
        let len = codec.encode(&msg, &mut buffer).unwrap();

        // Corrupt one byte
        buffer[5] ^= 0xFF;

        assert!(matches!(
            FrameCodec::parse(&buffer[..len]),
            Err(FrameError::CrcMismatch)
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let mut codec = FrameCodec::new();
        let msg = LinkMessage::Retired(sample_notice());
        let mut buffer = [0u8; MAX_FRAME_SIZE];
        let len = codec.encode(&msg, &mut buffer).unwrap();

        assert!(matches!(
            FrameCodec::parse(&buffer[..len - 3]),
            Err(FrameError::TooShort)
        ));
    }

    #[test]
    fn test_kind_conversion() {
        assert_eq!(MessageKind::try_from(0x01), Ok(MessageKind::Tag));
        assert_eq!(MessageKind::try_from(0x02), Ok(MessageKind::Retired));
        assert!(MessageKind::try_from(0x99).is_err());
    }
}
