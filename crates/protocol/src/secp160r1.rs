//! Elliptic curve Diffie-Hellman over secp160r1.
//!
//! The devices only speak this SEC 2 curve, which no maintained curve crate
//! ships, so the affine arithmetic lives here on top of `num-bigint`.
//! Public keys travel as raw `X || Y` (20 bytes each, big-endian).

use std::fmt;
use std::sync::OnceLock;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{ProtocolError, Result};

/// Size of one field element / coordinate in bytes.
pub const COORDINATE_SIZE: usize = 20;

/// Size of a raw `X || Y` public key.
pub const PUBLIC_KEY_SIZE: usize = 2 * COORDINATE_SIZE;

/// Size of the ECDH shared secret (the x-coordinate).
pub const SHARED_SECRET_SIZE: usize = COORDINATE_SIZE;

/// Random bytes drawn for a private scalar before reduction.
const SCALAR_SEED_SIZE: usize = 21;

struct Curve {
    p: BigUint,
    a: BigUint,
    b: BigUint,
    n: BigUint,
    g: Point,
}

fn curve() -> &'static Curve {
    static CURVE: OnceLock<Curve> = OnceLock::new();
    CURVE.get_or_init(|| {
        let hex = |s: &str| BigUint::parse_bytes(s.as_bytes(), 16).unwrap_or_default();
        let p = hex("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF7FFFFFFF");
        Curve {
            a: &p - 3u32,
            b: hex("1C97BEFC54BD7A8B65ACF89F81D4D4ADC565FA45"),
            n: hex("0100000000000000000001F4C8F927AED3CA752257"),
            g: Point {
                x: hex("4A96B5688EF573284664698968C38BB913CBFC82"),
                y: hex("23A628553168947D59DCC912042351377AC5FB32"),
            },
            p,
        }
    })
}

/// Affine point. Arithmetic uses `Option<Point>` with `None` as infinity.
#[derive(Clone, PartialEq, Eq)]
struct Point {
    x: BigUint,
    y: BigUint,
}

impl Curve {
    fn sub(&self, a: &BigUint, b: &BigUint) -> BigUint {
        ((a + &self.p) - (b % &self.p)) % &self.p
    }

    fn inverse(&self, a: &BigUint) -> BigUint {
        a.modpow(&(&self.p - 2u32), &self.p)
    }

    fn contains(&self, point: &Point) -> bool {
        if point.x >= self.p || point.y >= self.p {
            return false;
        }
        let lhs = (&point.y * &point.y) % &self.p;
        let rhs = (&point.x * &point.x * &point.x + &self.a * &point.x + &self.b) % &self.p;
        lhs == rhs
    }

    fn double(&self, point: &Point) -> Option<Point> {
        if point.y.is_zero() {
            return None;
        }
        let numerator = (BigUint::from(3u32) * &point.x * &point.x + &self.a) % &self.p;
        let denominator = self.inverse(&((BigUint::from(2u32) * &point.y) % &self.p));
        let lambda = (numerator * denominator) % &self.p;
        self.finish(&lambda, point, point)
    }

    fn add(&self, lhs: &Option<Point>, rhs: &Option<Point>) -> Option<Point> {
        let (p1, p2) = match (lhs, rhs) {
            (None, other) | (other, None) => return other.clone(),
            (Some(p1), Some(p2)) => (p1, p2),
        };
        if p1.x == p2.x {
            return if p1.y == p2.y { self.double(p1) } else { None };
        }
        let numerator = self.sub(&p2.y, &p1.y);
        let denominator = self.inverse(&self.sub(&p2.x, &p1.x));
        let lambda = (numerator * denominator) % &self.p;
        self.finish(&lambda, p1, p2)
    }

    fn finish(&self, lambda: &BigUint, p1: &Point, p2: &Point) -> Option<Point> {
        let x3 = self.sub(&self.sub(&((lambda * lambda) % &self.p), &p1.x), &p2.x);
        let y3 = self.sub(&((lambda * self.sub(&p1.x, &x3)) % &self.p), &p1.y);
        Some(Point { x: x3, y: y3 })
    }

    fn multiply(&self, scalar: &BigUint, point: &Point) -> Option<Point> {
        let mut result: Option<Point> = None;
        let mut addend = Some(point.clone());
        for bit in 0..scalar.bits() {
            if scalar.bit(bit) {
                result = self.add(&result, &addend);
            }
            addend = addend.as_ref().and_then(|p| self.double(p));
        }
        result
    }
}

fn to_fixed(value: &BigUint) -> [u8; COORDINATE_SIZE] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; COORDINATE_SIZE];
    out[COORDINATE_SIZE - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// A peer's validated public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    point: Point,
}

impl PublicKey {
    /// Parse a raw `X || Y` key or a SEC1 uncompressed (`0x04`-prefixed) key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw = match bytes.len() {
            PUBLIC_KEY_SIZE => bytes,
            n if n == PUBLIC_KEY_SIZE + 1 && bytes[0] == 0x04 => &bytes[1..],
            n => {
                return Err(ProtocolError::InvalidPublicKey(format!(
                    "expected {} byte secp160r1 point, got {} bytes",
                    PUBLIC_KEY_SIZE, n
                )))
            }
        };

        let point = Point {
            x: BigUint::from_bytes_be(&raw[..COORDINATE_SIZE]),
            y: BigUint::from_bytes_be(&raw[COORDINATE_SIZE..]),
        };
        if !curve().contains(&point) {
            return Err(ProtocolError::InvalidPublicKey(
                "point is not on secp160r1".to_string(),
            ));
        }
        Ok(Self { point })
    }

    /// Raw `X || Y` encoding.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out[..COORDINATE_SIZE].copy_from_slice(&to_fixed(&self.point.x));
        out[COORDINATE_SIZE..].copy_from_slice(&to_fixed(&self.point.y));
        out
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

/// Ephemeral key pair generated for one connection attempt.
pub struct KeyPair {
    secret: Zeroizing<[u8; COORDINATE_SIZE + 1]>,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the operating system RNG.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; SCALAR_SEED_SIZE]);
        OsRng.fill_bytes(&mut seed[..]);
        Self::from_seed(&seed[..])
    }

    /// Derive a key pair from seed bytes; the scalar lands in `[1, n-1]`.
    pub fn from_seed(seed: &[u8]) -> Self {
        let curve = curve();
        let scalar = BigUint::from_bytes_be(seed) % (&curve.n - 1u32) + BigUint::one();

        let mut secret = Zeroizing::new([0u8; COORDINATE_SIZE + 1]);
        let bytes = scalar.to_bytes_be();
        secret[COORDINATE_SIZE + 1 - bytes.len()..].copy_from_slice(&bytes);

        // scalar < n, so the product is never the point at infinity
        let point = curve
            .multiply(&scalar, &curve.g)
            .unwrap_or_else(|| curve.g.clone());
        Self {
            secret,
            public: PublicKey { point },
        }
    }

    /// The public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Raw `X || Y` public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Compute the shared secret with a peer: the x-coordinate of `d·Q`.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<Zeroizing<Vec<u8>>> {
        let curve = curve();
        let scalar = BigUint::from_bytes_be(&self.secret[..]);
        let shared = curve.multiply(&scalar, &peer.point).ok_or_else(|| {
            ProtocolError::InvalidPublicKey("shared point is the point at infinity".to_string())
        })?;
        Ok(Zeroizing::new(to_fixed(&shared.x).to_vec()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
