//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering framing, packet and crypto failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // Framing errors
    /// Checksum did not match the received bytes.
    #[error("crc mismatch: expected {expected:#06x}, got {got:#06x}")]
    Crc {
        /// Checksum computed over the received bytes.
        expected: u16,
        /// Checksum carried on the wire.
        got: u16,
    },

    /// Frame or packet does not start with the expected prefix.
    #[error("invalid prefix: expected {expected:#06x}, got {got:#06x}")]
    InvalidPrefix {
        /// Expected prefix value.
        expected: u16,
        /// Actual prefix received.
        got: u16,
    },

    /// Outer frame is structurally invalid.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Decrypted application packet is structurally invalid.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Session key derivation inputs were rejected.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Shared key material is required but the key exchange has not run.
    #[error("shared key missing: public key exchange has not completed")]
    SharedKeyMissing,

    /// Session traffic was attempted before the session key was derived.
    #[error("session key missing: cannot encrypt or decrypt before key derivation")]
    SessionKeyMissing,

    // Handshake errors
    /// Device answered a handshake step with an unexpected message.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Returns true for errors that only affect a single frame on the wire.
    ///
    /// The stream decoder drops such frames and keeps going.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::Crc { .. }
                | Self::InvalidPrefix { .. }
                | Self::MalformedFrame(_)
                | Self::MalformedPacket(_)
                | Self::Decryption(_)
        )
    }
}

impl From<cbc::cipher::block_padding::UnpadError> for ProtocolError {
    fn from(err: cbc::cipher::block_padding::UnpadError) -> Self {
        ProtocolError::Decryption(err.to_string())
    }
}

impl From<cbc::cipher::InvalidLength> for ProtocolError {
    fn from(err: cbc::cipher::InvalidLength) -> Self {
        ProtocolError::Encryption(err.to_string())
    }
}
