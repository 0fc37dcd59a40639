//! Error types for the connection engine.

use protocol::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::state::ConnectionState;
use crate::transport::TransportError;

/// Failure of a connection attempt or of an operation on a live connection.
///
/// Cloneable so the same error can be stored as the connection's last error,
/// handed to disconnect listeners and returned to waiters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    // Transport errors
    /// Transport connect or an awaited operation timed out.
    #[error("connection timed out: {0}")]
    Timeout(String),

    /// The device could not be found by the transport.
    #[error("device not found: {0}")]
    NotFound(String),

    /// Generic transport failure.
    #[error("transport failure: {0}")]
    Transport(String),

    // Protocol errors
    /// A frame or packet could not be decoded, or handshake crypto failed.
    #[error("packet parse failed: {0}")]
    PacketParse(#[from] ProtocolError),

    /// A request could not be written after all retries.
    #[error("failed to send request: {0}")]
    SendRequest(String),

    // Authentication errors
    /// The device rejected authentication or the key-info exchange.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Connection ended without reaching the authenticated state.
    #[error("failed to authenticate: connection ended in state {0}")]
    FailedToAuthenticate(ConnectionState),

    // Accumulated errors
    /// Too many recovered errors on one link.
    #[error("too many errors: {count} recovered errors, last: {last}")]
    TooManyErrors {
        /// Number of errors counted before giving up.
        count: u32,
        /// Description of the final error counted.
        last: String,
    },

    /// Initial connection attempts exhausted.
    #[error("could not connect after {attempts} attempts")]
    MaxConnectionAttempts {
        /// The configured attempt limit.
        attempts: u32,
        /// Error of the last failed attempt, if any.
        last_error: Option<Box<ConnectionError>>,
    },

    /// Reconnect attempts exhausted.
    #[error("could not reconnect after {attempts} attempts")]
    MaxReconnectAttempts {
        /// The configured attempt limit.
        attempts: u32,
        /// Error of the last failed attempt, if any.
        last_error: Option<Box<ConnectionError>>,
    },

    // Configuration errors
    /// The connection was built with out-of-range settings.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    // Collaborator errors
    /// The device collaborator failed to handle a packet.
    #[error("device error: {0}")]
    Device(String),

    /// Anything else.
    #[error("unexpected failure: {0}")]
    Unknown(String),
}

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;

impl ConnectionError {
    /// The error state a connection enters when this error ends an attempt.
    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Timeout(_) => ConnectionState::ErrorTimeout,
            Self::NotFound(_) => ConnectionState::ErrorNotFound,
            Self::Transport(_) => ConnectionState::ErrorTransport,
            Self::PacketParse(_) => ConnectionState::ErrorPacketParse,
            Self::SendRequest(_) => ConnectionState::ErrorSendRequest,
            Self::AuthFailed(_) => ConnectionState::ErrorAuthFailed,
            Self::TooManyErrors { .. } => ConnectionState::ErrorTooManyErrors,
            Self::MaxReconnectAttempts { .. } => ConnectionState::ErrorMaxReconnectAttemptsReached,
            Self::FailedToAuthenticate(_)
            | Self::MaxConnectionAttempts { .. }
            | Self::Config(_)
            | Self::Device(_)
            | Self::Unknown(_) => ConnectionState::ErrorUnknown,
        }
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => ConnectionError::Timeout(msg),
            TransportError::NotFound(msg) => ConnectionError::NotFound(msg),
            TransportError::NotConnected => ConnectionError::Transport(err.to_string()),
            TransportError::Failed(msg) => ConnectionError::Transport(msg),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ConnectionError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ConnectionError::Timeout(err.to_string())
    }
}
