//! Frame codec for the outer BLE wire frames.
//!
//! # Frame Format
//!
//! Every frame written to or read from the device characteristic has the
//! same shape:
//! - 2 bytes: prefix `0x5A 0x5A`
//! - 1 byte: frame type in the high nibble (command or protocol)
//! - 1 byte: constant `0x01`
//! - 2 bytes: length (little-endian, payload length + 2)
//! - N bytes: payload
//! - 2 bytes: CRC-16/ARC over header and payload (little-endian)
//!
//! Simple frames carry plaintext and are only used for the first two
//! handshake exchanges. Encrypted frames carry AES-CBC ciphertext.
//!
//! # Streaming
//!
//! The transport delivers notifications of arbitrary size. A notification
//! may hold several frames and may end mid-frame, so [`FrameDecoder`] keeps
//! a carry buffer between deliveries.

use bytes::{Buf, BytesMut};

use crate::crc::crc16;
use crate::crypto::CryptoSession;
use crate::error::{ProtocolError, Result};
use crate::packet::ApplicationPacket;

/// Prefix identifying the start of a frame.
pub const FRAME_PREFIX: [u8; 2] = [0x5A, 0x5A];

/// Frame header size: 2 (prefix) + 1 (type) + 1 (constant) + 2 (length).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Size of the CRC trailer.
pub const FRAME_CRC_SIZE: usize = 2;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize - FRAME_CRC_SIZE;

/// Fourth header byte. Always `0x01` on the wire.
const FRAME_MARKER: u8 = 0x01;

/// Frame type carried in the high nibble of the third header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Handshake command frames.
    Command,
    /// Encrypted application traffic.
    Protocol,
}

impl FrameType {
    /// Returns the raw nibble value.
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Command => 0x00,
            FrameType::Protocol => 0x01,
        }
    }

    /// Parse a frame type from the raw header byte.
    pub fn from_header_byte(byte: u8) -> Option<Self> {
        match byte >> 4 {
            0x00 => Some(FrameType::Command),
            0x01 => Some(FrameType::Protocol),
            _ => None,
        }
    }
}

/// Encode a payload into a frame of the given type.
pub fn encode_frame(frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "payload of {} bytes exceeds maximum of {} bytes",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let length = (payload.len() + FRAME_CRC_SIZE) as u16;
    let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_CRC_SIZE);
    output.extend_from_slice(&FRAME_PREFIX);
    output.push(frame_type.as_u8() << 4);
    output.push(FRAME_MARKER);
    output.extend_from_slice(&length.to_le_bytes());
    output.extend_from_slice(payload);

    let crc = crc16(&output);
    output.extend_from_slice(&crc.to_le_bytes());
    Ok(output)
}

/// Encode a plaintext handshake payload as a simple (command) frame.
pub fn encode_simple(payload: &[u8]) -> Result<Vec<u8>> {
    encode_frame(FrameType::Command, payload)
}

/// Wrap ciphertext in a protocol frame.
pub fn encode_encrypted(ciphertext: &[u8]) -> Result<Vec<u8>> {
    encode_frame(FrameType::Protocol, ciphertext)
}

/// Decode the frame at the start of `data` and return its payload.
///
/// Bytes past the end of the first frame are ignored.
pub fn decode_simple(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "insufficient data for frame header: need {} bytes, have {}",
            FRAME_HEADER_SIZE,
            data.len()
        )));
    }
    check_prefix(data)?;

    let frame_len = FRAME_HEADER_SIZE + declared_length(data)?;
    if data.len() < frame_len {
        return Err(ProtocolError::MalformedFrame(format!(
            "insufficient data for frame: need {} bytes, have {}",
            frame_len,
            data.len()
        )));
    }

    open_frame(&data[..frame_len])
}

fn check_prefix(data: &[u8]) -> Result<()> {
    if data[..2] != FRAME_PREFIX {
        return Err(ProtocolError::InvalidPrefix {
            expected: u16::from_be_bytes(FRAME_PREFIX),
            got: u16::from_be_bytes([data[0], data[1]]),
        });
    }
    Ok(())
}

/// Length field of a header, validated to at least cover the CRC trailer.
fn declared_length(header: &[u8]) -> Result<usize> {
    let length = u16::from_le_bytes([header[4], header[5]]) as usize;
    if length < FRAME_CRC_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "length field {} is shorter than the crc trailer",
            length
        )));
    }
    Ok(length)
}

/// Validate the CRC of a complete frame and return its payload.
fn open_frame(frame: &[u8]) -> Result<Vec<u8>> {
    let crc_start = frame.len() - FRAME_CRC_SIZE;
    let expected = crc16(&frame[..crc_start]);
    let got = u16::from_le_bytes([frame[crc_start], frame[crc_start + 1]]);
    if expected != got {
        return Err(ProtocolError::Crc { expected, got });
    }
    Ok(frame[FRAME_HEADER_SIZE..crc_start].to_vec())
}

/// Streaming decoder holding the carry buffer for partial frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: BytesMut,
}

impl FrameDecoder {
    /// Create a decoder with an empty carry buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.carry.len()
    }

    /// Drop any buffered partial frame.
    pub fn clear(&mut self) {
        self.carry.clear();
    }

    /// Append a transport delivery and extract every complete frame payload.
    ///
    /// Each element is either a payload or the framing error that caused the
    /// frame to be dropped. Errors never stop the scan; an incomplete tail
    /// stays buffered for the next call.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Vec<u8>>> {
        self.carry.extend_from_slice(data);
        let mut frames = Vec::new();

        while self.carry.len() >= FRAME_HEADER_SIZE {
            if let Err(err) = check_prefix(&self.carry) {
                let skip = self.resync_offset();
                self.carry.advance(skip);
                frames.push(Err(err));
                continue;
            }

            let length = match declared_length(&self.carry) {
                Ok(length) => length,
                Err(err) => {
                    self.carry.advance(FRAME_HEADER_SIZE);
                    frames.push(Err(err));
                    continue;
                }
            };

            let frame_len = FRAME_HEADER_SIZE + length;
            if self.carry.len() < frame_len {
                break;
            }

            let frame = self.carry.split_to(frame_len);
            frames.push(open_frame(&frame));
        }

        frames
    }

    /// Feed a delivery and open every complete frame with `open`.
    ///
    /// Failures from `open` are reported per frame, the same way framing
    /// errors are.
    pub fn decode_stream<T, F>(&mut self, data: &[u8], mut open: F) -> Vec<Result<T>>
    where
        F: FnMut(&[u8]) -> Result<T>,
    {
        self.feed(data)
            .into_iter()
            .map(|frame| frame.and_then(|payload| open(&payload)))
            .collect()
    }

    /// Feed a delivery of encrypted frames and decode application packets
    /// under the session key.
    pub fn decode_encrypted_stream(
        &mut self,
        data: &[u8],
        session: &CryptoSession,
    ) -> Vec<Result<ApplicationPacket>> {
        self.decode_stream(data, |payload| {
            let plaintext = session.decrypt_session(payload)?;
            ApplicationPacket::from_bytes(&plaintext)
        })
    }

    /// Offset of the next possible frame start after a bad prefix.
    fn resync_offset(&self) -> usize {
        match self.carry[1..]
            .windows(FRAME_PREFIX.len())
            .position(|window| window == FRAME_PREFIX)
        {
            Some(position) => position + 1,
            // Keep a trailing prefix byte; its partner may be in the next delivery.
            None if self.carry.last() == Some(&FRAME_PREFIX[0]) => self.carry.len() - 1,
            None => self.carry.len(),
        }
    }
}
