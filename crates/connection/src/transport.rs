//! Transport boundary consumed by the connection engine.
//!
//! The platform BLE stack (GATT connect, notify, write) lives behind the
//! [`Transport`] trait. The engine never scans or enumerates devices; it is
//! handed a transport already bound to one peripheral.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

/// Errors reported by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Operation did not complete in time.
    #[error("transport timed out: {0}")]
    Timeout(String),

    /// Peripheral is not reachable.
    #[error("peripheral not found: {0}")]
    NotFound(String),

    /// Operation requires a connected link.
    #[error("transport not connected")]
    NotConnected,

    /// Any other platform failure.
    #[error("transport failed: {0}")]
    Failed(String),
}

/// Result type alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Callback for inbound notifications.
pub type NotificationHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Callback invoked when the link drops, whether or not it was requested.
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// A BLE link to one peripheral.
///
/// At most one notification subscription is active at a time; subscribing
/// again replaces the previous handler.
pub trait Transport: Send + Sync {
    /// Open the link. `on_disconnect` fires every time the link goes down.
    fn connect<'a>(
        &'a self,
        on_disconnect: DisconnectHandler,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + 'a>>;

    /// Write bytes to the device's write characteristic.
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + 'a>>;

    /// Start delivering notifications to `handler`.
    fn subscribe<'a>(
        &'a self,
        handler: NotificationHandler,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + 'a>>;

    /// Stop delivering notifications.
    fn unsubscribe<'a>(&'a self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + 'a>>;

    /// Whether the link is currently up.
    fn is_connected(&self) -> bool;

    /// Close the link.
    fn disconnect<'a>(&'a self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + 'a>>;
}
