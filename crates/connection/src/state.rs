//! Connection lifecycle states and listener registries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    NotConnected,
    Created,
    EstablishingConnection,
    Connected,
    PublicKeyExchange,
    PublicKeyReceived,
    RequestingSessionKey,
    SessionKeyReceived,
    RequestingAuthStatus,
    AuthStatusReceived,
    Authenticating,
    Authenticated,
    Reconnecting,
    Disconnecting,
    Disconnected,

    ErrorTimeout,
    ErrorNotFound,
    ErrorTransport,
    ErrorPacketParse,
    ErrorSendRequest,
    ErrorUnknown,
    ErrorAuthFailed,
    ErrorTooManyErrors,
    ErrorMaxReconnectAttemptsReached,
}

impl ConnectionState {
    /// Transport is up and the handshake has not finished.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::EstablishingConnection
                | Self::Connected
                | Self::PublicKeyExchange
                | Self::PublicKeyReceived
                | Self::RequestingSessionKey
                | Self::SessionKeyReceived
                | Self::RequestingAuthStatus
                | Self::AuthStatusReceived
                | Self::Authenticating
        )
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ErrorTimeout
                | Self::ErrorNotFound
                | Self::ErrorTransport
                | Self::ErrorPacketParse
                | Self::ErrorSendRequest
                | Self::ErrorUnknown
                | Self::ErrorAuthFailed
                | Self::ErrorTooManyErrors
                | Self::ErrorMaxReconnectAttemptsReached
        )
    }

    /// Waiting on the connection can stop in this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Authenticated | Self::Disconnected | Self::NotConnected
        ) || self.is_error()
    }

    pub fn authenticated(self) -> bool {
        self == Self::Authenticated
    }

    /// Stable snake_case name, as used in serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Created => "created",
            Self::EstablishingConnection => "establishing_connection",
            Self::Connected => "connected",
            Self::PublicKeyExchange => "public_key_exchange",
            Self::PublicKeyReceived => "public_key_received",
            Self::RequestingSessionKey => "requesting_session_key",
            Self::SessionKeyReceived => "session_key_received",
            Self::RequestingAuthStatus => "requesting_auth_status",
            Self::AuthStatusReceived => "auth_status_received",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Reconnecting => "reconnecting",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::ErrorTimeout => "error_timeout",
            Self::ErrorNotFound => "error_not_found",
            Self::ErrorTransport => "error_transport",
            Self::ErrorPacketParse => "error_packet_parse",
            Self::ErrorSendRequest => "error_send_request",
            Self::ErrorUnknown => "error_unknown",
            Self::ErrorAuthFailed => "error_auth_failed",
            Self::ErrorTooManyErrors => "error_too_many_errors",
            Self::ErrorMaxReconnectAttemptsReached => "error_max_reconnect_attempts_reached",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current and previous state, published on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    pub previous: ConnectionState,
}

impl StateSnapshot {
    pub(crate) fn initial() -> Self {
        Self {
            state: ConnectionState::Created,
            previous: ConnectionState::Created,
        }
    }
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    handlers: BTreeMap<u64, Handler<T>>,
}

/// Registry of synchronous listeners for values of type `T`.
///
/// Handlers run in registration order on the thread that calls
/// [`Listeners::notify`]. Registering returns a [`Subscription`]; dropping it
/// removes the handler.
pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }

    /// Register a handler.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.insert(id, Arc::new(handler));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.lock().handlers.remove(&id);
            }
        })
    }

    /// Call every registered handler with `value`.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe while being called.
    pub fn notify(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self.registry.lock().handlers.values().cloned().collect();
        for handler in handlers {
            handler(value);
        }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.registry.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered listener. Dropping it unregisters the listener.
#[must_use = "dropping a Subscription immediately unregisters the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unregister now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
