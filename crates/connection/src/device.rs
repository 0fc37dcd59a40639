//! Device collaborator interface and model selection.
//!
//! Telemetry decoding is product specific and lives outside this crate.
//! Each product family implements [`Device`]; the connection picks one
//! implementation up front by matching the serial number.

use std::sync::Arc;

use protocol::ApplicationPacket;

/// Bluetooth company identifier carried in EcoFlow advertisements.
pub const MANUFACTURER_ID: u16 = 0xB5B5;

/// Length of the serial number embedded in manufacturer data.
pub const SERIAL_NUMBER_LEN: usize = 16;

/// Per-product-model packet handling.
pub trait Device: Send + Sync {
    /// Human-readable model name, used in logs.
    fn name(&self) -> &str;

    /// Whether this implementation handles the device with `serial_number`.
    fn matches(&self, serial_number: &str) -> bool;

    /// Decode decrypted packet bytes.
    ///
    /// Override for device families that obfuscate payloads.
    fn decode_packet(&self, data: &[u8]) -> protocol::Result<ApplicationPacket> {
        ApplicationPacket::from_bytes(data)
    }

    /// Consume an application packet.
    ///
    /// Returns `Ok(false)` when the packet is not one this device understands.
    fn parse_application_payload(&self, packet: &ApplicationPacket) -> anyhow::Result<bool>;

    /// Whether `packet` must be echoed back as a keep-alive.
    fn requires_reply(&self, _packet: &ApplicationPacket) -> bool {
        false
    }

    /// Build serialized packet bytes carrying a configuration change.
    fn build_config_frame(&self, fields: &[u8]) -> protocol::Result<Vec<u8>>;
}

/// Serial-number prefix matcher for product families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPrefix(Vec<String>);

impl SerialPrefix {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(prefixes.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, serial_number: &str) -> bool {
        self.0.iter().any(|prefix| serial_number.starts_with(prefix.as_str()))
    }
}

/// Pick the first candidate that claims `serial_number`.
pub fn select_device(candidates: &[Arc<dyn Device>], serial_number: &str) -> Option<Arc<dyn Device>> {
    candidates
        .iter()
        .find(|device| device.matches(serial_number))
        .cloned()
}

/// Information extracted from an advertisement's manufacturer data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    pub serial_number: String,
}

impl ManufacturerData {
    /// Parse manufacturer data for `company_id`.
    ///
    /// Returns `None` for other vendors or data too short to hold a serial.
    pub fn parse(company_id: u16, data: &[u8]) -> Option<Self> {
        if company_id != MANUFACTURER_ID {
            return None;
        }
        let raw = data.get(1..1 + SERIAL_NUMBER_LEN)?;
        let serial_number = std::str::from_utf8(raw).ok()?.to_string();
        Some(Self { serial_number })
    }
}
