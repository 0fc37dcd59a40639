//! Print wire test vectors for interop testing against device captures.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::crc::{crc16, crc8};
use protocol::{derive_session_key, encode_simple, md5, ApplicationPacket, KeyTable};

fn main() {
    println!("crc16(\"123456789\") = {:#06x}", crc16(b"123456789"));
    println!("crc8(\"123456789\")  = {:#04x}", crc8(b"123456789"));

    // Handshake step 3: key info request
    let key_info = encode_simple(&[0x02]).expect("encode failed");
    print_test_vector("key_info_request_frame", &key_info);

    // Plaintext auth status probe
    let status = ApplicationPacket::auth_status_request()
        .to_bytes()
        .expect("encode failed");
    print_test_vector("auth_status_packet", &status);

    // Plaintext authenticate request for a sample account
    let auth = ApplicationPacket::authenticate("1234567890", "R331ZEB4ZEA0012345")
        .to_bytes()
        .expect("encode failed");
    print_test_vector("authenticate_packet", &auth);

    // Degenerate KDF case
    let table = KeyTable::new(vec![0u8; 4096]);
    let key = derive_session_key([0x05, 0x01], &[0u8; 16], &table).expect("kdf failed");
    print_test_vector("session_key_zero", &key);
    assert_eq!(key, md5(&[0u8; 32]));
}

fn print_test_vector(name: &str, bytes: &[u8]) {
    println!("{} = {}", name, hex::encode(bytes));
}
