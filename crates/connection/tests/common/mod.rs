//! Simulated EcoFlow device behind an in-memory transport.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use connection::{
    ConnectionConfig, Credentials, Device, DisconnectHandler, NotificationHandler, SerialPrefix,
    Transport, TransportError, TransportResult,
};
use parking_lot::Mutex;
use protocol::packet::{AUTHENTICATE_CMD_ID, AUTH_ADDRESS, AUTH_CMD_SET, AUTH_STATUS_CMD_ID};
use protocol::{
    encode_encrypted, encode_simple, ApplicationPacket, CryptoSession, FrameDecoder, KeyTable,
};

pub const USER_ID: &str = "1700000000000000001";
pub const SERIAL: &str = "R331ZEB4ZEA01234";

const SRAND: [u8; 16] = *b"0123456789abcdef";
const SEED: [u8; 2] = [0x2A, 0x07];

type BoxFuture<'a> = Pin<Box<dyn Future<Output = TransportResult<()>> + Send + 'a>>;

pub fn key_table() -> KeyTable {
    KeyTable::new(
        (0..4096u32)
            .map(|i| (i.wrapping_mul(31) % 251) as u8)
            .collect::<Vec<u8>>(),
    )
}

pub fn credentials() -> Credentials {
    Credentials::new(USER_ID, SERIAL)
}

/// Test config with reconnect off; tests opt in where they need it.
pub fn config() -> ConnectionConfig {
    ConnectionConfig::default().reconnect_enabled(false)
}

/// Device collaborator that records every packet offered to it.
pub struct RecordingDevice {
    prefixes: SerialPrefix,
    pub packets: Mutex<Vec<ApplicationPacket>>,
}

impl RecordingDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            prefixes: SerialPrefix::new(["R33"]),
            packets: Mutex::new(Vec::new()),
        })
    }
}

impl Device for RecordingDevice {
    fn name(&self) -> &str {
        "delta-test"
    }

    fn matches(&self, serial_number: &str) -> bool {
        self.prefixes.matches(serial_number)
    }

    fn parse_application_payload(&self, packet: &ApplicationPacket) -> anyhow::Result<bool> {
        if packet.cmd_set == 0xEE {
            anyhow::bail!("unsupported telemetry layout");
        }
        self.packets.lock().push(packet.clone());
        Ok(packet.cmd_set == 0xFE)
    }

    fn build_config_frame(&self, fields: &[u8]) -> protocol::Result<Vec<u8>> {
        ApplicationPacket::new(0x21, 0x02, 0xFE, 0x11, fields.to_vec()).to_bytes()
    }
}

/// Device side of the protocol.
struct Peer {
    session: CryptoSession,
    decoder: FrameDecoder,
    auth_result: u8,
    silent: bool,
    bad_key: bool,
    received: Vec<ApplicationPacket>,
    authenticated_with: Option<Vec<u8>>,
}

impl Peer {
    fn new(auth_result: u8, silent: bool, bad_key: bool) -> Self {
        Self {
            session: CryptoSession::new(),
            decoder: FrameDecoder::new(),
            auth_result,
            silent,
            bad_key,
            received: Vec::new(),
            authenticated_with: None,
        }
    }

    fn seal(&self, packet: &ApplicationPacket) -> Vec<u8> {
        let ciphertext = self
            .session
            .encrypt_session(&packet.to_bytes().unwrap())
            .unwrap();
        encode_encrypted(&ciphertext).unwrap()
    }

    fn respond(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut responses = Vec::new();
        for payload in self.decoder.feed(data) {
            let payload = payload.expect("client sent a malformed frame");
            if self.silent {
                continue;
            }

            if self.bad_key {
                assert_eq!(&payload[..2], &[0x01, 0x00]);
                // (1, 1) is not on secp160r1.
                let mut response = vec![0x01, 0x00, 0x00];
                response.extend_from_slice(&[0u8; 19]);
                response.push(0x01);
                response.extend_from_slice(&[0u8; 19]);
                response.push(0x01);
                responses.push(encode_simple(&response).unwrap());
            } else if !self.session.has_shared_key() {
                assert_eq!(&payload[..2], &[0x01, 0x00]);
                self.session.compute_shared_secret(&payload[2..], 0).unwrap();
                let mut response = vec![0x01, 0x00, 0x00];
                response.extend_from_slice(&self.session.public_key_bytes());
                responses.push(encode_simple(&response).unwrap());
            } else if !self.session.has_session_key() {
                assert_eq!(payload, vec![0x02]);
                let mut key_info = SRAND.to_vec();
                key_info.extend_from_slice(&SEED);
                let mut response = vec![0x02];
                response.extend(self.session.encrypt_shared(&key_info).unwrap());
                responses.push(encode_simple(&response).unwrap());
                self.session
                    .derive_session_key(SEED, &SRAND, &key_table())
                    .unwrap();
            } else {
                let plaintext = self.session.decrypt_session(&payload).unwrap();
                let packet = ApplicationPacket::from_bytes(&plaintext).unwrap();
                match (packet.dst, packet.cmd_set, packet.cmd_id) {
                    (AUTH_ADDRESS, AUTH_CMD_SET, AUTH_STATUS_CMD_ID) => {
                        let status = ApplicationPacket::new(
                            AUTH_ADDRESS,
                            0x21,
                            AUTH_CMD_SET,
                            AUTH_STATUS_CMD_ID,
                            vec![0x00],
                        );
                        responses.push(self.seal(&status));
                    }
                    (AUTH_ADDRESS, AUTH_CMD_SET, AUTHENTICATE_CMD_ID) => {
                        self.authenticated_with = Some(packet.payload.clone());
                        let result = ApplicationPacket::new(
                            AUTH_ADDRESS,
                            0x21,
                            AUTH_CMD_SET,
                            AUTHENTICATE_CMD_ID,
                            vec![self.auth_result],
                        );
                        responses.push(self.seal(&result));
                    }
                    _ => self.received.push(packet),
                }
            }
        }
        responses
    }
}

struct State {
    connected: bool,
    connect_calls: u32,
    connect_error: Option<TransportError>,
    auth_result: u8,
    silent: bool,
    bad_key: bool,
    failing_writes: u32,
    fragment: Option<usize>,
    noise: Vec<u8>,
    handler: Option<NotificationHandler>,
    on_disconnect: Option<DisconnectHandler>,
    peer: Peer,
    writes: u32,
}

/// In-memory transport wired to a simulated device.
pub struct MockTransport {
    state: Mutex<State>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                connected: false,
                connect_calls: 0,
                connect_error: None,
                auth_result: 0x00,
                silent: false,
                bad_key: false,
                failing_writes: 0,
                fragment: None,
                noise: Vec::new(),
                handler: None,
                on_disconnect: None,
                peer: Peer::new(0x00, false, false),
                writes: 0,
            }),
        })
    }

    /// Answer the authenticate request with `status`.
    pub fn reject_auth(&self, status: u8) {
        self.state.lock().auth_result = status;
    }

    /// Never answer handshake requests.
    pub fn silence(&self) {
        self.state.lock().silent = true;
    }

    /// Answer requests again after [`MockTransport::silence`].
    pub fn unsilence(&self) {
        self.state.lock().silent = false;
    }

    /// Answer the public key request with a point that is not on the curve.
    pub fn send_bad_public_key(&self) {
        self.state.lock().bad_key = true;
    }

    /// Fail the next `count` writes without delivering them.
    pub fn fail_writes(&self, count: u32) {
        self.state.lock().failing_writes = count;
    }

    /// Deliver device responses in chunks of `size` bytes.
    pub fn fragment(&self, size: usize) {
        self.state.lock().fragment = Some(size);
    }

    /// Prefix every device response with bytes that are not a frame.
    pub fn add_noise(&self, noise: &[u8]) {
        self.state.lock().noise = noise.to_vec();
    }

    pub fn fail_connect(&self, err: Option<TransportError>) {
        self.state.lock().connect_error = err;
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().connect_calls
    }

    pub fn writes(&self) -> u32 {
        self.state.lock().writes
    }

    /// Packets the device received after authentication.
    pub fn received(&self) -> Vec<ApplicationPacket> {
        self.state.lock().peer.received.clone()
    }

    pub fn authenticated_with(&self) -> Option<Vec<u8>> {
        self.state.lock().peer.authenticated_with.clone()
    }

    /// Drop the link as if the device went out of range.
    pub fn drop_link(&self) {
        let on_disconnect = {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.handler = None;
            state.on_disconnect.take()
        };
        if let Some(on_disconnect) = on_disconnect {
            on_disconnect();
        }
    }

    /// Encrypt `packet` under the device's session key and notify it.
    pub fn device_send(&self, packet: &ApplicationPacket) {
        let frame = self.state.lock().peer.seal(packet);
        self.notify(frame);
    }

    /// Deliver raw bytes to the subscribed handler.
    pub fn notify(&self, data: Vec<u8>) {
        let handler = self.state.lock().handler.clone();
        if let Some(handler) = handler {
            handler(data);
        }
    }
}

impl Transport for MockTransport {
    fn connect<'a>(&'a self, on_disconnect: DisconnectHandler) -> BoxFuture<'a> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.connect_calls += 1;
            if let Some(err) = state.connect_error.clone() {
                return Err(err);
            }
            state.connected = true;
            state.on_disconnect = Some(on_disconnect);
            state.peer = Peer::new(state.auth_result, state.silent, state.bad_key);
            Ok(())
        })
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a> {
        Box::pin(async move {
            let (handler, deliveries) = {
                let mut state = self.state.lock();
                if !state.connected {
                    return Err(TransportError::NotConnected);
                }
                state.writes += 1;
                if state.failing_writes > 0 {
                    state.failing_writes -= 1;
                    return Err(TransportError::Failed("write rejected".into()));
                }

                let responses = state.peer.respond(data);
                let mut deliveries = Vec::new();
                for response in responses {
                    let mut bytes = state.noise.clone();
                    bytes.extend(response);
                    match state.fragment {
                        Some(size) => deliveries.extend(bytes.chunks(size).map(<[u8]>::to_vec)),
                        None => deliveries.push(bytes),
                    }
                }
                (state.handler.clone(), deliveries)
            };

            if let Some(handler) = handler {
                for delivery in deliveries {
                    handler(delivery);
                }
            }
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, handler: NotificationHandler) -> BoxFuture<'a> {
        Box::pin(async move {
            self.state.lock().handler = Some(handler);
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self) -> BoxFuture<'a> {
        Box::pin(async move {
            self.state.lock().handler = None;
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn disconnect<'a>(&'a self) -> BoxFuture<'a> {
        Box::pin(async move {
            self.drop_link();
            Ok(())
        })
    }
}
