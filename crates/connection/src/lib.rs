//! # EcoFlow BLE Connection Engine
//!
//! This crate drives an encrypted session with an EcoFlow device over a BLE
//! link supplied by the caller.
//!
//! ## Overview
//!
//! The engine is transport agnostic: scanning, GATT connect and
//! characteristic I/O live behind the [`Transport`] trait. On top of it the
//! crate provides:
//!
//! - **Handshake**: public key exchange, session key derivation and
//!   authentication with the account id and device serial
//! - **State Machine**: observable [`ConnectionState`] transitions with
//!   listener subscriptions and a `watch` channel
//! - **Request Dispatch**: writes with bounded linear-backoff retry and
//!   fire-and-forget keep-alive replies
//! - **Reconnect Supervisor**: bounded reconnect rounds after unexpected
//!   link loss
//! - **Device Collaborators**: per-model packet handling selected by serial
//!   number prefix
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Connection handle                    │
//! ├──────────────┬───────────────────────┬──────────────────┤
//! │  Reconnect   │    Connection driver  │   Application    │
//! │  supervisor  │  (handshake + errors) │    dispatch      │
//! ├──────────────┴───────────┬───────────┴──────────────────┤
//! │    Request dispatcher    │      protocol crate          │
//! ├──────────────────────────┴──────────────────────────────┤
//! │                   Transport (BLE GATT)                  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use connection::{Connection, ConnectionConfig, Credentials, Device, Transport};
//! use protocol::KeyTable;
//!
//! async fn run(
//!     transport: Arc<dyn Transport>,
//!     device: Arc<dyn Device>,
//!     key_table: KeyTable,
//! ) -> connection::Result<()> {
//!     let config = ConnectionConfig::load("efble.toml").unwrap_or_default();
//!     let credentials = Credentials::new("1234567890", "R331ZEB4ZEA01234");
//!
//!     let conn = Connection::new(transport, credentials, key_table, device, config)?;
//!     let _states = conn.on_state_change(|state| println!("state: {state}"));
//!
//!     conn.connect().await?;
//!     conn.wait_connected(Duration::from_secs(20)).await?;
//!
//!     // Telemetry now flows to the device collaborator
//!     conn.send_config(&[0x01]).await?;
//!
//!     conn.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: Public handle, connection driver and reconnect loop
//! - [`handshake`]: Handshake messages and response parsing
//! - `dispatcher`: Outbound writes with retry (crate internal)
//! - [`dispatch`]: Routing of inbound packets
//! - [`device`]: Device collaborator trait and model selection
//! - [`state`]: Connection states and listener registries
//! - [`reconnect`]: Reconnect backoff policy
//! - [`transport`]: Transport boundary
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing setup
//! - [`error`]: Error types

pub mod config;
pub mod connection;
pub mod device;
pub mod dispatch;
pub(crate) mod dispatcher;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod reconnect;
pub mod state;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::{ConfigError, ConnectionConfig, LoggingConfig};
pub use connection::Connection;
pub use device::{select_device, Device, ManufacturerData, SerialPrefix, MANUFACTURER_ID};
pub use dispatch::ApplicationDispatch;
pub use error::{ConnectionError, Result};
pub use handshake::{Credentials, Handshake};
pub use logging::init_tracing;
pub use reconnect::ReconnectPolicy;
pub use state::{ConnectionState, Listeners, StateSnapshot, Subscription};
pub use transport::{
    DisconnectHandler, NotificationHandler, Transport, TransportError, TransportResult,
};
