//! Handshake message construction and response parsing.
//!
//! [`Handshake`] owns the per-attempt [`CryptoSession`] and the frame carry
//! buffer. It performs no I/O; the connection driver feeds it transport
//! deliveries and writes the frames it produces.
//!
//! Exchange order:
//!
//! 1. public key request (simple frame) → device public key
//! 2. key info request (simple frame) → `srand` and `seed`, encrypted under
//!    the shared key
//! 3. auth status probe (encrypted) → any packet
//! 4. authenticate (encrypted) → auth response, seen by the general listener

use std::sync::Arc;

use protocol::{
    encode_encrypted, encode_simple, public_key_size, ApplicationPacket, CryptoSession,
    FrameDecoder, KeyTable, ProtocolError,
};

use crate::device::Device;
use crate::error::{ConnectionError, Result};
use crate::logging::Dumps;

/// Handshake command byte for the public key exchange.
pub const PUBLIC_KEY_EXCHANGE: u8 = 0x01;

/// Handshake command byte for the key info request.
pub const KEY_INFO_REQUEST: u8 = 0x02;

/// Type byte the device puts in front of the key info response.
pub const KEY_INFO_RESPONSE: u8 = 0x02;

/// Account and device identity used for authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub serial_number: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, serial_number: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            serial_number: serial_number.into(),
        }
    }
}

pub struct Handshake {
    session: CryptoSession,
    decoder: FrameDecoder,
    key_table: KeyTable,
    credentials: Credentials,
    device: Arc<dyn Device>,
    dumps: Dumps,
}

impl Handshake {
    /// Start a handshake with a fresh ephemeral key pair.
    pub fn new(credentials: Credentials, key_table: KeyTable, device: Arc<dyn Device>) -> Self {
        Self::with_session(CryptoSession::new(), credentials, key_table, device)
    }

    pub fn with_session(
        session: CryptoSession,
        credentials: Credentials,
        key_table: KeyTable,
        device: Arc<dyn Device>,
    ) -> Self {
        Self {
            session,
            decoder: FrameDecoder::new(),
            key_table,
            credentials,
            device,
            dumps: Dumps::default(),
        }
    }

    pub(crate) fn with_dumps(mut self, dumps: Dumps) -> Self {
        self.dumps = dumps;
        self
    }

    pub fn session(&self) -> &CryptoSession {
        &self.session
    }

    /// Step 1: `01 00` followed by the raw local public key.
    pub fn public_key_request(&self) -> Result<Vec<u8>> {
        let mut payload = vec![PUBLIC_KEY_EXCHANGE, 0x00];
        payload.extend_from_slice(&self.session.public_key_bytes());
        Ok(encode_simple(&payload)?)
    }

    /// Feed a handshake-phase delivery and return the complete frame
    /// payloads in it.
    pub fn feed_frames(&mut self, data: &[u8]) -> Vec<protocol::Result<Vec<u8>>> {
        self.decoder.feed(data)
    }

    /// Step 2: parse the device's public key and compute the shared key.
    ///
    /// Byte 2 selects the key size; the key follows at byte 3.
    pub fn accept_public_key(&mut self, payload: &[u8]) -> Result<()> {
        let selector = *payload.get(2).ok_or_else(|| {
            ProtocolError::UnexpectedResponse(format!(
                "public key response of {} bytes has no curve selector",
                payload.len()
            ))
        })?;
        let size = public_key_size(selector);
        let key = payload.get(3..3 + size).ok_or_else(|| {
            ProtocolError::UnexpectedResponse(format!(
                "public key response of {} bytes is too short for a {} byte key",
                payload.len(),
                size
            ))
        })?;

        self.session.compute_shared_secret(key, selector)?;
        Ok(())
    }

    /// Step 3 request.
    pub fn key_info_request(&self) -> Result<Vec<u8>> {
        Ok(encode_simple(&[KEY_INFO_REQUEST])?)
    }

    /// Step 4: decrypt `srand` and `seed` and derive the session key.
    pub fn accept_key_info(&mut self, payload: &[u8]) -> Result<()> {
        match payload.first() {
            Some(&KEY_INFO_RESPONSE) => {}
            other => {
                return Err(ConnectionError::AuthFailed(format!(
                    "unexpected key info response type {:?}",
                    other
                )))
            }
        }

        let data = self.session.decrypt_shared(&payload[1..])?;
        self.dumps.decrypted(&data);
        if data.len() < 18 {
            return Err(ProtocolError::KeyDerivation(format!(
                "key info of {} bytes cannot hold srand and seed",
                data.len()
            ))
            .into());
        }

        let srand = &data[..16];
        let seed = [data[16], data[17]];
        self.session
            .derive_session_key(seed, srand, &self.key_table)?;
        Ok(())
    }

    /// Step 5 request: the empty auth status probe.
    pub fn auth_status_request(&self) -> Result<Vec<u8>> {
        self.seal(&ApplicationPacket::auth_status_request())
    }

    /// Step 7 request: authenticate with the account and serial.
    pub fn authentication_request(&self) -> Result<Vec<u8>> {
        self.seal(&ApplicationPacket::authenticate(
            &self.credentials.user_id,
            &self.credentials.serial_number,
        ))
    }

    /// Encrypt a packet under the session key and frame it.
    pub fn seal(&self, packet: &ApplicationPacket) -> Result<Vec<u8>> {
        self.seal_bytes(&packet.to_bytes()?)
    }

    /// Encrypt serialized packet bytes under the session key and frame them.
    pub fn seal_bytes(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = self.session.encrypt_session(packet)?;
        Ok(encode_encrypted(&ciphertext)?)
    }

    /// Feed an encrypted-phase delivery and decode every complete packet.
    ///
    /// Failed frames are reported in place and do not affect the others.
    pub fn decode_packets(&mut self, data: &[u8]) -> Vec<protocol::Result<ApplicationPacket>> {
        let session = &self.session;
        let device = &self.device;
        let dumps = self.dumps;
        self.decoder.decode_stream(data, |payload| {
            let plaintext = session.decrypt_session(payload)?;
            dumps.decrypted(&plaintext);
            device.decode_packet(&plaintext)
        })
    }
}
