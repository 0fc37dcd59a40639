//! Tracing setup and payload dump helpers.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a formatting subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false` if
/// a global subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Which payload dumps are switched on for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Dumps {
    pub connection: bool,
    pub encrypted: bool,
    pub decrypted: bool,
    pub packets: bool,
}

impl From<&LoggingConfig> for Dumps {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            connection: config.connection_debug,
            encrypted: config.encrypted_payloads,
            decrypted: config.decrypted_payloads,
            packets: config.packets,
        }
    }
}

impl Dumps {
    pub fn encrypted(&self, direction: &str, data: &[u8]) {
        if self.encrypted {
            tracing::debug!(direction, bytes = data.len(), data = %hex::encode(data), "raw frame data");
        }
    }

    pub fn decrypted(&self, data: &[u8]) {
        if self.decrypted {
            tracing::debug!(bytes = data.len(), data = %hex::encode(data), "decrypted packet");
        }
    }

    pub fn packet(&self, packet: &protocol::ApplicationPacket) {
        if self.packets {
            tracing::debug!(
                src = packet.src,
                dst = packet.dst,
                cmd_set = packet.cmd_set,
                cmd_id = packet.cmd_id,
                version = packet.version,
                sequence = packet.sequence,
                payload = %hex::encode(&packet.payload),
                "packet"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dumps_from_config() {
        let config = LoggingConfig {
            encrypted_payloads: true,
            packets: true,
            ..LoggingConfig::default()
        };
        let dumps = Dumps::from(&config);
        assert!(dumps.encrypted);
        assert!(dumps.packets);
        assert!(!dumps.decrypted);
        assert!(!dumps.connection);
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
