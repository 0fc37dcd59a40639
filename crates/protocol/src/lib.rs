//! # EcoFlow BLE Protocol Library
//!
//! This crate provides the wire format and cryptographic primitives for
//! talking to EcoFlow portable power stations over Bluetooth Low Energy.
//!
//! ## Overview
//!
//! Everything here is synchronous and runtime-free; the connection engine in
//! the `connection` crate drives it. The crate provides:
//!
//! - **Frame Codec**: `0x5A5A`-prefixed frames with CRC-16/ARC trailers and a
//!   streaming decoder that reassembles fragmented notifications
//! - **Application Packets**: `0xAA`-prefixed packets with addressing,
//!   command ids and checksums
//! - **Key Exchange**: ephemeral ECDH on secp160r1
//! - **Crypto Session**: shared key, IV and vendor session-key derivation,
//!   with AES-128-CBC traffic encryption
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Packets            │  0xAA header, CRC8 + CRC16
//! ├─────────────────────────────────────────┤
//! │            AES-128-CBC                  │  shared key, then session key
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  0x5A5A, length, CRC16
//! ├─────────────────────────────────────────┤
//! │          BLE GATT notify/write          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{encode_encrypted, ApplicationPacket, CryptoSession, FrameDecoder, KeyTable};
//!
//! // Both ends run the key exchange
//! let mut client = CryptoSession::new();
//! let mut device = CryptoSession::new();
//! client.compute_shared_secret(&device.public_key_bytes(), 0).unwrap();
//! device.compute_shared_secret(&client.public_key_bytes(), 0).unwrap();
//!
//! // Session key from the key-info response and the vendor table
//! let table = KeyTable::new(vec![0u8; 4096]);
//! client.derive_session_key([0x05, 0x01], &[0u8; 16], &table).unwrap();
//! device.derive_session_key([0x05, 0x01], &[0u8; 16], &table).unwrap();
//!
//! // Encrypt a packet into a frame
//! let packet = ApplicationPacket::auth_status_request();
//! let ciphertext = client.encrypt_session(&packet.to_bytes().unwrap()).unwrap();
//! let frame = encode_encrypted(&ciphertext).unwrap();
//!
//! // The receiving side reassembles and decrypts
//! let mut decoder = FrameDecoder::new();
//! let packets = decoder.decode_encrypted_stream(&frame, &device);
//! assert_eq!(packets[0].as_ref().unwrap(), &packet);
//! ```
//!
//! ## Modules
//!
//! - [`frame`]: Outer frame codec and stream reassembly
//! - [`packet`]: Application packet layout and handshake packets
//! - [`crypto`]: Session keys, KDF and AES-CBC
//! - [`secp160r1`]: Curve arithmetic for the key exchange
//! - [`crc`]: Wire checksums
//! - [`error`]: Error types

pub mod crc;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod packet;
pub mod secp160r1;

pub use crypto::{derive_session_key, md5, public_key_size, CryptoSession, KeyTable, KEY_SIZE};
pub use error::{ProtocolError, Result};
pub use frame::{
    decode_simple, encode_encrypted, encode_frame, encode_simple, FrameDecoder, FrameType,
    FRAME_CRC_SIZE, FRAME_HEADER_SIZE, FRAME_PREFIX, MAX_PAYLOAD_SIZE,
};
pub use packet::{ApplicationPacket, DEFAULT_VERSION, PACKET_PREFIX};
pub use secp160r1::{KeyPair, PublicKey, PUBLIC_KEY_SIZE};
