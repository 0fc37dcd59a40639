//! Routing of decoded inbound packets.

use std::sync::Arc;

use protocol::ApplicationPacket;

use crate::device::Device;

/// Address devices use as the source of keep-alive pings.
pub const KEEP_ALIVE_SRC: u8 = 0x02;
pub const KEEP_ALIVE_CMD_SET: u8 = 0x02;
pub const KEEP_ALIVE_CMD_ID: u8 = 0x01;

/// What the connection should do with an inbound packet.
#[derive(Debug)]
pub enum Inbound {
    /// Answer to the authenticate request.
    AuthResponse { success: bool },
    /// Any other packet, already offered to the device.
    Application(Routed),
}

/// Result of offering a packet to the device.
#[derive(Debug)]
pub struct Routed {
    /// Echo to send back as a keep-alive.
    pub reply: Option<ApplicationPacket>,
    /// Whether the device understood the packet.
    pub handled: anyhow::Result<bool>,
}

/// Routes post-authentication packets to the device collaborator and the
/// keep-alive responder.
pub struct ApplicationDispatch {
    device: Arc<dyn Device>,
}

impl ApplicationDispatch {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self { device }
    }

    /// Generic ping that every device family expects echoed.
    pub fn is_keep_alive(packet: &ApplicationPacket) -> bool {
        packet.src == KEEP_ALIVE_SRC
            && packet.cmd_set == KEEP_ALIVE_CMD_SET
            && packet.cmd_id == KEEP_ALIVE_CMD_ID
    }

    pub fn route(&self, packet: &ApplicationPacket) -> Inbound {
        if packet.is_auth_response() {
            return Inbound::AuthResponse {
                success: packet.is_auth_success(),
            };
        }

        let reply = (Self::is_keep_alive(packet) || self.device.requires_reply(packet))
            .then(|| packet.reply());
        Inbound::Application(Routed {
            reply,
            handled: self.device.parse_application_payload(packet),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use protocol::packet::{AUTHENTICATE_CMD_ID, AUTH_ADDRESS, AUTH_CMD_SET};

    /// Records packets and echoes cmd_id 0x04.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u8>>,
    }

    impl Device for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn matches(&self, _serial_number: &str) -> bool {
            true
        }

        fn parse_application_payload(&self, packet: &ApplicationPacket) -> anyhow::Result<bool> {
            if packet.cmd_set == 0xFF {
                anyhow::bail!("bad payload");
            }
            self.seen.lock().push(packet.cmd_id);
            Ok(packet.cmd_set == 0xFE)
        }

        fn requires_reply(&self, packet: &ApplicationPacket) -> bool {
            packet.src == 0x02 && packet.cmd_set == 0x02 && packet.cmd_id == 0x04
        }

        fn build_config_frame(&self, fields: &[u8]) -> protocol::Result<Vec<u8>> {
            ApplicationPacket::new(0x21, 0x02, 0xFE, 0x11, fields.to_vec()).to_bytes()
        }
    }

    fn dispatch() -> (ApplicationDispatch, Arc<Recorder>) {
        let device = Arc::new(Recorder::default());
        (ApplicationDispatch::new(device.clone()), device)
    }

    fn routed(inbound: Inbound) -> Routed {
        match inbound {
            Inbound::Application(routed) => routed,
            other => panic!("expected application packet, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_is_echoed() {
        let (dispatch, device) = dispatch();
        let ping = ApplicationPacket::new(0x02, 0x21, 0x02, 0x01, vec![0x11]).with_sequence(42);

        let routed = routed(dispatch.route(&ping));
        let reply = routed.reply.unwrap();
        assert_eq!((reply.src, reply.dst), (0x21, 0x02));
        assert_eq!(reply.sequence, 42);
        assert_eq!(reply.payload, vec![0x11]);
        assert!(!routed.handled.unwrap());
        assert_eq!(*device.seen.lock(), vec![0x01]);
    }

    #[test]
    fn test_device_requested_reply() {
        let (dispatch, _) = dispatch();
        let packet = ApplicationPacket::new(0x02, 0x21, 0x02, 0x04, vec![]);
        assert!(routed(dispatch.route(&packet)).reply.is_some());

        let packet = ApplicationPacket::new(0x03, 0x21, 0x02, 0x01, vec![]);
        assert!(routed(dispatch.route(&packet)).reply.is_none());
    }

    #[test]
    fn test_telemetry_is_handled() {
        let (dispatch, _) = dispatch();
        let packet = ApplicationPacket::new(0x02, 0x21, 0xFE, 0x15, vec![1, 2, 3]);
        let routed = routed(dispatch.route(&packet));
        assert!(routed.reply.is_none());
        assert!(routed.handled.unwrap());
    }

    #[test]
    fn test_device_error_is_surfaced() {
        let (dispatch, _) = dispatch();
        let packet = ApplicationPacket::new(0x02, 0x21, 0xFF, 0x15, vec![]);
        let err = routed(dispatch.route(&packet)).handled.unwrap_err();
        assert_eq!(err.to_string(), "bad payload");
    }

    #[test]
    fn test_auth_response_is_not_offered_to_device() {
        let (dispatch, device) = dispatch();
        let ok = ApplicationPacket::new(AUTH_ADDRESS, 0x21, AUTH_CMD_SET, AUTHENTICATE_CMD_ID, vec![0x00]);
        assert!(matches!(dispatch.route(&ok), Inbound::AuthResponse { success: true }));

        let rejected =
            ApplicationPacket::new(AUTH_ADDRESS, 0x21, AUTH_CMD_SET, AUTHENTICATE_CMD_ID, vec![0x01]);
        assert!(matches!(
            dispatch.route(&rejected),
            Inbound::AuthResponse { success: false }
        ));
        assert!(device.seen.lock().is_empty());
    }
}
