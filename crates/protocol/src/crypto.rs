//! Per-connection key material and AES-CBC traffic encryption.
//!
//! A [`CryptoSession`] is created for every connection attempt and holds:
//!
//! - the ephemeral secp160r1 key pair,
//! - the shared key (first 16 bytes of the ECDH secret) used during the
//!   handshake,
//! - the IV (MD5 of the full ECDH secret), fixed for the connection,
//! - the session key produced by the vendor KDF, used for everything after
//!   the key-info exchange.
//!
//! Every encrypt/decrypt call builds a fresh AES-128-CBC cipher with PKCS7
//! padding.

use std::fmt;
use std::sync::Arc;

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use zeroize::Zeroizing;

use crate::error::{ProtocolError, Result};
use crate::secp160r1::{KeyPair, PublicKey, PUBLIC_KEY_SIZE};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES key and IV length.
pub const KEY_SIZE: usize = 16;

/// Length of the `srand` value the device sends in the key-info response.
pub const SRAND_SIZE: usize = 16;

/// Length of the `seed` value the device sends in the key-info response.
pub const SEED_SIZE: usize = 2;

/// `srand` values this long or longer are rejected by the KDF.
pub const SRAND_LIMIT: usize = 32;

/// MD5 digest of `data`.
pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(data));
    out
}

/// Length in bytes of the peer's public key for a curve-size selector.
///
/// Selectors 1 to 4 name larger curves the vendor firmware can report, but
/// only the 40 byte secp160r1 key of the default selector can be parsed, so
/// [`CryptoSession::compute_shared_secret`] rejects keys cut for 1 to 4 with
/// [`ProtocolError::InvalidPublicKey`].
pub fn public_key_size(selector: u8) -> usize {
    match selector {
        1 => 52,
        2 => 56,
        3 | 4 => 64,
        _ => 40,
    }
}

/// Vendor lookup table consumed by the session key derivation.
///
/// Opaque read-only bytes shared across connections. The table must be at
/// least `seed[0] * 16 + (seed[1] - 1) * 256 + 16` bytes for every seed the
/// device may send; 4096 bytes covers the standard asset.
#[derive(Clone)]
pub struct KeyTable(Arc<[u8]>);

impl KeyTable {
    /// Wrap table bytes.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// Table size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read a little-endian u64 at `pos`.
    pub fn read_u64_le(&self, pos: usize) -> Result<u64> {
        let bytes = pos
            .checked_add(8)
            .and_then(|end| self.0.get(pos..end))
            .ok_or_else(|| {
                ProtocolError::KeyDerivation(format!(
                    "key table of {} bytes has no u64 at offset {}",
                    self.0.len(),
                    pos
                ))
            })?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }
}

impl fmt::Debug for KeyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyTable").field(&self.0.len()).finish()
    }
}

/// Derive the session key from the key-info response.
///
/// `pos = seed[0]*16 + ((seed[1]-1) mod 256)*256`; the key is the MD5 of the
/// table words at `pos` and `pos+8` followed by the two words of `srand`,
/// all little-endian.
pub fn derive_session_key(seed: [u8; 2], srand: &[u8], table: &KeyTable) -> Result<[u8; 16]> {
    if srand.len() >= SRAND_LIMIT {
        return Err(ProtocolError::KeyDerivation(format!(
            "srand of {} bytes is not supported",
            srand.len()
        )));
    }
    if srand.len() < SRAND_SIZE {
        return Err(ProtocolError::KeyDerivation(format!(
            "srand must be at least {} bytes, got {}",
            SRAND_SIZE,
            srand.len()
        )));
    }

    let pos = seed[0] as usize * 16 + seed[1].wrapping_sub(1) as usize * 256;
    let mut words = [0u64; 4];
    words[0] = table.read_u64_le(pos)?;
    words[1] = table.read_u64_le(pos + 8)?;
    for (i, chunk) in srand[..SRAND_SIZE].chunks_exact(8).enumerate() {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        words[2 + i] = u64::from_le_bytes(word);
    }

    let mut input = Zeroizing::new([0u8; 32]);
    for (i, word) in words.iter().enumerate() {
        input[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
    }
    Ok(md5(&input[..]))
}

fn encrypt(key: &[u8; KEY_SIZE], iv: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128CbcEnc::new_from_slices(key, iv)?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn decrypt(key: &[u8; KEY_SIZE], iv: &[u8; KEY_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % KEY_SIZE != 0 {
        return Err(ProtocolError::Decryption(format!(
            "ciphertext of {} bytes is not a whole number of blocks",
            ciphertext.len()
        )));
    }
    let cipher = Aes128CbcDec::new_from_slices(key, iv)?;
    Ok(cipher.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)?)
}

/// Key material for a single connection attempt.
pub struct CryptoSession {
    keypair: KeyPair,
    peer_public_key: Option<PublicKey>,
    shared_key: Option<Zeroizing<[u8; KEY_SIZE]>>,
    iv: Option<[u8; KEY_SIZE]>,
    session_key: Option<Zeroizing<[u8; KEY_SIZE]>>,
}

impl CryptoSession {
    /// Start a session with a freshly generated ephemeral key pair.
    pub fn new() -> Self {
        Self::with_keypair(KeyPair::generate())
    }

    /// Start a session with a given key pair.
    pub fn with_keypair(keypair: KeyPair) -> Self {
        Self {
            keypair,
            peer_public_key: None,
            shared_key: None,
            iv: None,
            session_key: None,
        }
    }

    /// Local public key, raw `X || Y`.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.keypair.public_key_bytes()
    }

    /// The device's public key once the exchange has run.
    pub fn peer_public_key(&self) -> Option<&PublicKey> {
        self.peer_public_key.as_ref()
    }

    /// Whether the shared key and IV exist.
    pub fn has_shared_key(&self) -> bool {
        self.shared_key.is_some()
    }

    /// Whether the session key has been derived.
    pub fn has_session_key(&self) -> bool {
        self.session_key.is_some()
    }

    /// Connection IV once the shared secret exists.
    pub fn iv(&self) -> Option<&[u8; KEY_SIZE]> {
        self.iv.as_ref()
    }

    /// Run ECDH against the device key and set up the shared key and IV.
    ///
    /// `peer_key` must already be cut to [`public_key_size`] of `selector`.
    pub fn compute_shared_secret(&mut self, peer_key: &[u8], selector: u8) -> Result<()> {
        let expected = public_key_size(selector);
        if peer_key.len() != expected {
            return Err(ProtocolError::InvalidPublicKey(format!(
                "selector {} expects a {} byte key, got {} bytes",
                selector,
                expected,
                peer_key.len()
            )));
        }

        let peer = PublicKey::from_bytes(peer_key)?;
        let secret = self.keypair.diffie_hellman(&peer)?;
        if secret.len() < KEY_SIZE {
            return Err(ProtocolError::InvalidPublicKey(format!(
                "shared secret of {} bytes is shorter than the {} byte shared key",
                secret.len(),
                KEY_SIZE
            )));
        }

        let mut shared_key = Zeroizing::new([0u8; KEY_SIZE]);
        shared_key.copy_from_slice(&secret[..KEY_SIZE]);
        self.iv = Some(md5(&secret));
        self.shared_key = Some(shared_key);
        self.peer_public_key = Some(peer);
        self.session_key = None;
        Ok(())
    }

    /// Derive and store the session key.
    pub fn derive_session_key(&mut self, seed: [u8; 2], srand: &[u8], table: &KeyTable) -> Result<()> {
        let key = derive_session_key(seed, srand, table)?;
        self.session_key = Some(Zeroizing::new(key));
        Ok(())
    }

    fn shared(&self) -> Result<(&[u8; KEY_SIZE], &[u8; KEY_SIZE])> {
        match (&self.shared_key, &self.iv) {
            (Some(key), Some(iv)) => Ok((&**key, iv)),
            _ => Err(ProtocolError::SharedKeyMissing),
        }
    }

    fn session(&self) -> Result<(&[u8; KEY_SIZE], &[u8; KEY_SIZE])> {
        match (&self.session_key, &self.iv) {
            (Some(key), Some(iv)) => Ok((&**key, iv)),
            _ => Err(ProtocolError::SessionKeyMissing),
        }
    }

    /// Encrypt under the shared key.
    pub fn encrypt_shared(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (key, iv) = self.shared()?;
        encrypt(key, iv, plaintext)
    }

    /// Decrypt under the shared key.
    pub fn decrypt_shared(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (key, iv) = self.shared()?;
        decrypt(key, iv, ciphertext)
    }

    /// Encrypt under the session key.
    pub fn encrypt_session(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (key, iv) = self.session()?;
        encrypt(key, iv, plaintext)
    }

    /// Decrypt under the session key.
    pub fn decrypt_session(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (key, iv) = self.session()?;
        decrypt(key, iv, ciphertext)
    }
}

impl Default for CryptoSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("public_key", self.keypair.public_key())
            .field("has_shared_key", &self.has_shared_key())
            .field("has_session_key", &self.has_session_key())
            .finish()
    }
}
