//! Application packets carried inside encrypted frames.
//!
//! # Packet Format
//!
//! ```text
//! 0      0xAA
//! 1      version
//! 2..4   payload length (u16 LE)
//! 4      crc8 over bytes 0..4
//! 5      product id
//! 6..10  sequence (u32 LE)
//! 10..12 reserved
//! 12     src
//! 13     dst
//! 14     ack flag        (version 3 and later)
//! 15     needs-ack flag  (version 3 and later)
//! ..     cmd_set, cmd_id, payload
//! end    crc16 over everything before it (u16 LE)
//! ```

use crate::crc::{crc16, crc8};
use crate::crypto::md5;
use crate::error::{ProtocolError, Result};

/// First byte of every application packet.
pub const PACKET_PREFIX: u8 = 0xAA;

/// Version used for packets built by this crate.
pub const DEFAULT_VERSION: u8 = 3;

/// Oldest packet version understood by the decoder.
pub const MIN_VERSION: u8 = 2;

/// Address of this client on the device bus.
pub const APP_ADDRESS: u8 = 0x21;

/// Address the device uses for the authentication service.
pub const AUTH_ADDRESS: u8 = 0x35;

/// Command set of the authentication service.
pub const AUTH_CMD_SET: u8 = 0x35;

/// Command id of the authenticate request and its response.
pub const AUTHENTICATE_CMD_ID: u8 = 0x86;

/// Command id of the auth status probe.
pub const AUTH_STATUS_CMD_ID: u8 = 0x89;

/// Payload the device sends when authentication succeeds.
pub const AUTH_SUCCESS: &[u8] = &[0x00];

const CRC_SIZE: usize = 2;

/// Decrypted, structured message carried in a frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationPacket {
    pub src: u8,
    pub dst: u8,
    pub cmd_set: u8,
    pub cmd_id: u8,
    pub payload: Vec<u8>,
    pub ack_flag: u8,
    pub needs_ack_flag: u8,
    pub version: u8,
    pub sequence: u32,
    pub product_id: u8,
}

impl ApplicationPacket {
    /// Create a packet with default version and zeroed flags, sequence and
    /// product id.
    pub fn new(src: u8, dst: u8, cmd_set: u8, cmd_id: u8, payload: Vec<u8>) -> Self {
        Self {
            src,
            dst,
            cmd_set,
            cmd_id,
            payload,
            ack_flag: 0,
            needs_ack_flag: 0,
            version: DEFAULT_VERSION,
            sequence: 0,
            product_id: 0,
        }
    }

    /// Set the ack and needs-ack flags.
    pub fn with_flags(mut self, ack_flag: u8, needs_ack_flag: u8) -> Self {
        self.ack_flag = ack_flag;
        self.needs_ack_flag = needs_ack_flag;
        self
    }

    /// Set the packet version.
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Set the sequence number.
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Set the product id.
    pub fn with_product_id(mut self, product_id: u8) -> Self {
        self.product_id = product_id;
        self
    }

    /// The empty "auth status" probe sent once the session key exists.
    pub fn auth_status_request() -> Self {
        Self::new(
            APP_ADDRESS,
            AUTH_ADDRESS,
            AUTH_CMD_SET,
            AUTH_STATUS_CMD_ID,
            Vec::new(),
        )
        .with_flags(0x01, 0x01)
    }

    /// The authenticate request for a user and device serial.
    ///
    /// The payload is the uppercase hex of `md5(user_id ++ serial)`.
    pub fn authenticate(user_id: &str, serial_number: &str) -> Self {
        let mut input = Vec::with_capacity(user_id.len() + serial_number.len());
        input.extend_from_slice(user_id.as_bytes());
        input.extend_from_slice(serial_number.as_bytes());
        let digest = hex::encode_upper(md5(&input));

        Self::new(
            APP_ADDRESS,
            AUTH_ADDRESS,
            AUTH_CMD_SET,
            AUTHENTICATE_CMD_ID,
            digest.into_bytes(),
        )
        .with_flags(0x01, 0x01)
    }

    /// Whether this packet is the device's answer to an authenticate request.
    pub fn is_auth_response(&self) -> bool {
        self.src == AUTH_ADDRESS
            && self.cmd_set == AUTH_CMD_SET
            && self.cmd_id == AUTHENTICATE_CMD_ID
    }

    /// Whether an auth response reports success.
    pub fn is_auth_success(&self) -> bool {
        self.payload == AUTH_SUCCESS
    }

    /// Build the echo of this packet used for keep-alive replies.
    pub fn reply(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            cmd_set: self.cmd_set,
            cmd_id: self.cmd_id,
            payload: self.payload.clone(),
            ack_flag: 0x01,
            needs_ack_flag: 0x01,
            version: self.version,
            sequence: self.sequence,
            product_id: self.product_id,
        }
    }

    fn has_flag_bytes(version: u8) -> bool {
        version >= 3
    }

    fn header_len(version: u8) -> usize {
        if Self::has_flag_bytes(version) {
            18
        } else {
            16
        }
    }

    /// Serialize the packet.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.version < MIN_VERSION {
            return Err(ProtocolError::MalformedPacket(format!(
                "unsupported packet version {}",
                self.version
            )));
        }
        let payload_len = u16::try_from(self.payload.len()).map_err(|_| {
            ProtocolError::MalformedPacket(format!(
                "payload of {} bytes does not fit the length field",
                self.payload.len()
            ))
        })?;

        let mut out =
            Vec::with_capacity(Self::header_len(self.version) + self.payload.len() + CRC_SIZE);
        out.push(PACKET_PREFIX);
        out.push(self.version);
        out.extend_from_slice(&payload_len.to_le_bytes());
        out.push(crc8(&out[..4]));
        out.push(self.product_id);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&[0x00, 0x00]);
        out.push(self.src);
        out.push(self.dst);
        if Self::has_flag_bytes(self.version) {
            out.push(self.ack_flag);
            out.push(self.needs_ack_flag);
        }
        out.push(self.cmd_set);
        out.push(self.cmd_id);
        out.extend_from_slice(&self.payload);

        let crc = crc16(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Parse a packet, validating prefix, header checksum, length and trailer.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(ProtocolError::MalformedPacket(format!(
                "insufficient data for packet header: have {} bytes",
                data.len()
            )));
        }
        if data[0] != PACKET_PREFIX {
            return Err(ProtocolError::InvalidPrefix {
                expected: PACKET_PREFIX as u16,
                got: data[0] as u16,
            });
        }

        let header_crc = crc8(&data[..4]);
        if header_crc != data[4] {
            return Err(ProtocolError::Crc {
                expected: header_crc as u16,
                got: data[4] as u16,
            });
        }

        let version = data[1];
        if version < MIN_VERSION {
            return Err(ProtocolError::MalformedPacket(format!(
                "unsupported packet version {}",
                version
            )));
        }

        let payload_len = u16::from_le_bytes([data[2], data[3]]) as usize;
        let header_len = Self::header_len(version);
        let total_len = header_len + payload_len + CRC_SIZE;
        if data.len() < total_len {
            return Err(ProtocolError::MalformedPacket(format!(
                "insufficient data for packet: need {} bytes, have {}",
                total_len,
                data.len()
            )));
        }

        let crc_start = header_len + payload_len;
        let expected = crc16(&data[..crc_start]);
        let got = u16::from_le_bytes([data[crc_start], data[crc_start + 1]]);
        if expected != got {
            return Err(ProtocolError::Crc { expected, got });
        }

        let (ack_flag, needs_ack_flag, command_at) = if Self::has_flag_bytes(version) {
            (data[14], data[15], 16)
        } else {
            (0, 0, 14)
        };

        Ok(Self {
            src: data[12],
            dst: data[13],
            cmd_set: data[command_at],
            cmd_id: data[command_at + 1],
            payload: data[header_len..crc_start].to_vec(),
            ack_flag,
            needs_ack_flag,
            version,
            sequence: u32::from_le_bytes([data[6], data[7], data[8], data[9]]),
            product_id: data[5],
        })
    }

    /// Parse a packet whose payload is XORed with the low sequence byte.
    ///
    /// Some device families obfuscate payloads this way; the checksums cover
    /// the obfuscated bytes.
    pub fn from_bytes_xor(data: &[u8]) -> Result<Self> {
        let mut packet = Self::from_bytes(data)?;
        let key = packet.sequence.to_le_bytes()[0];
        packet.payload.iter_mut().for_each(|byte| *byte ^= key);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ApplicationPacket {
        ApplicationPacket::new(0x02, 0x21, 0x02, 0x01, vec![0x10, 0x20, 0x30])
            .with_flags(0x00, 0x01)
            .with_sequence(0x0403_0201)
            .with_product_id(0x0D)
    }

    #[test]
    fn test_packet_layout_v3() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(bytes[0], PACKET_PREFIX);
        assert_eq!(bytes[1], 3);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 3);
        assert_eq!(bytes[4], crc8(&bytes[..4]));
        assert_eq!(bytes[5], 0x0D);
        assert_eq!(&bytes[6..10], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[10..12], &[0x00, 0x00]);
        assert_eq!(&bytes[12..18], &[0x02, 0x21, 0x00, 0x01, 0x02, 0x01]);
        assert_eq!(&bytes[18..21], &[0x10, 0x20, 0x30]);
        assert_eq!(bytes.len(), 23);
        let crc = crc16(&bytes[..21]);
        assert_eq!(&bytes[21..], &crc.to_le_bytes());
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = sample();
        let parsed = ApplicationPacket::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_packet_v2_has_no_flag_bytes() {
        let packet = ApplicationPacket::new(0x20, 0x21, 0x20, 0x02, vec![0xAB]).with_version(2);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.len(), 16 + 1 + 2);
        assert_eq!(&bytes[12..16], &[0x20, 0x21, 0x20, 0x02]);

        let parsed = ApplicationPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.cmd_set, 0x20);
        assert_eq!(parsed.cmd_id, 0x02);
        assert_eq!(parsed.payload, vec![0xAB]);
    }

    #[test]
    fn test_empty_payload() {
        let packet = ApplicationPacket::auth_status_request();
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.len(), 20);
        let parsed = ApplicationPacket::from_bytes(&bytes).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_auth_status_request_constants() {
        let packet = ApplicationPacket::auth_status_request();
        assert_eq!(packet.src, 0x21);
        assert_eq!(packet.dst, 0x35);
        assert_eq!(packet.cmd_set, 0x35);
        assert_eq!(packet.cmd_id, 0x89);
        assert_eq!((packet.ack_flag, packet.needs_ack_flag), (0x01, 0x01));
        assert_eq!(packet.version, 3);
    }

    #[test]
    fn test_authenticate_payload_is_uppercase_md5_hex() {
        let packet = ApplicationPacket::authenticate("user", "SN123");
        let expected = hex::encode_upper(md5(b"userSN123"));
        assert_eq!(packet.payload, expected.into_bytes());
        assert_eq!(packet.payload.len(), 32);
        assert!(packet
            .payload
            .iter()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(b)));
        assert_eq!(packet.cmd_id, AUTHENTICATE_CMD_ID);
    }

    #[test]
    fn test_auth_response_detection() {
        let ok = ApplicationPacket::new(0x35, 0x21, 0x35, 0x86, vec![0x00]);
        assert!(ok.is_auth_response());
        assert!(ok.is_auth_success());

        let rejected = ApplicationPacket::new(0x35, 0x21, 0x35, 0x86, vec![0x01]);
        assert!(rejected.is_auth_response());
        assert!(!rejected.is_auth_success());

        let other = ApplicationPacket::new(0x02, 0x21, 0x35, 0x86, vec![0x00]);
        assert!(!other.is_auth_response());
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let packet = sample();
        let reply = packet.reply();
        assert_eq!(reply.src, packet.dst);
        assert_eq!(reply.dst, packet.src);
        assert_eq!(reply.cmd_set, packet.cmd_set);
        assert_eq!(reply.cmd_id, packet.cmd_id);
        assert_eq!(reply.payload, packet.payload);
        assert_eq!(reply.sequence, packet.sequence);
        assert_eq!(reply.product_id, packet.product_id);
        assert_eq!((reply.ack_flag, reply.needs_ack_flag), (0x01, 0x01));
    }

    #[test]
    fn test_from_bytes_rejects_bad_prefix() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = 0xAB;
        assert!(matches!(
            ApplicationPacket::from_bytes(&bytes),
            Err(ProtocolError::InvalidPrefix { .. })
        ));
    }

    #[test]
    fn test_from_bytes_rejects_header_crc() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[4] ^= 0xFF;
        assert!(matches!(
            ApplicationPacket::from_bytes(&bytes),
            Err(ProtocolError::Crc { .. })
        ));
    }

    #[test]
    fn test_from_bytes_rejects_body_crc() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[19] ^= 0x01;
        assert!(matches!(
            ApplicationPacket::from_bytes(&bytes),
            Err(ProtocolError::Crc { .. })
        ));
    }

    #[test]
    fn test_from_bytes_rejects_truncation() {
        let bytes = sample().to_bytes().unwrap();
        assert!(matches!(
            ApplicationPacket::from_bytes(&bytes[..3]),
            Err(ProtocolError::MalformedPacket(_))
        ));
        assert!(matches!(
            ApplicationPacket::from_bytes(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_from_bytes_rejects_old_version() {
        let mut bytes = vec![PACKET_PREFIX, 0x01, 0x00, 0x00];
        bytes.push(crc8(&bytes));
        bytes.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            ApplicationPacket::from_bytes(&bytes),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_from_bytes_xor() {
        let plain = vec![0x01, 0x02, 0xFF];
        let key = 0x5Cu8;
        let obfuscated: Vec<u8> = plain.iter().map(|b| b ^ key).collect();
        let packet = ApplicationPacket::new(0x02, 0x21, 0x02, 0x01, obfuscated)
            .with_sequence(0x1122_3300 | key as u32);

        let parsed = ApplicationPacket::from_bytes_xor(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.payload, plain);
    }
}
