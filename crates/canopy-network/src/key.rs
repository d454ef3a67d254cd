//! Key material on the Ristretto group.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::Sum;
use std::ops::Add;

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::{RngCore, SeedableRng};

use crate::NetworkError;

/// A public key: one Ristretto point, 32 bytes on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(RistrettoPoint);

impl PublicKey {
    /// The neutral element. Sum of an empty set of keys.
    pub fn identity() -> Self {
        Self(RistrettoPoint::identity())
    }

    pub fn from_point(point: RistrettoPoint) -> Self {
        Self(point)
    }

    pub fn as_point(&self) -> &RistrettoPoint {
        &self.0
    }

    /// Canonical compressed encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        let compressed = CompressedRistretto::from_slice(bytes)
            .map_err(|_| NetworkError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        compressed
            .decompress()
            .map(Self)
            .ok_or_else(|| NetworkError::InvalidKey("not a valid ristretto point".into()))
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, NetworkError> {
        Self::from_bytes(&from_hex(s)?)
    }
}

impl Add for PublicKey {
    type Output = PublicKey;

    fn add(self, rhs: PublicKey) -> PublicKey {
        PublicKey(self.0 + rhs.0)
    }
}

impl<'a> Sum<&'a PublicKey> for PublicKey {
    fn sum<I: Iterator<Item = &'a PublicKey>>(iter: I) -> Self {
        iter.fold(PublicKey::identity(), |acc, k| acc + *k)
    }
}

impl Sum for PublicKey {
    fn sum<I: Iterator<Item = PublicKey>>(iter: I) -> Self {
        iter.fold(PublicKey::identity(), |acc, k| acc + k)
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "PublicKey({}...)", &hex[..12])
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <serde_bytes::ByteBuf as serde::Deserialize>::deserialize(deserializer)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// A secret scalar. Never printed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SecretKey(Scalar);

impl SecretKey {
    pub fn as_scalar(&self) -> &Scalar {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NetworkError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(Scalar::from_bytes_mod_order(arr)))
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, NetworkError> {
        Self::from_bytes(&from_hex(s)?)
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(RISTRETTO_BASEPOINT_POINT * self.0)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

/// A secret scalar and its public point.
#[derive(Clone, Copy, Debug)]
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Fresh key pair from the thread-local RNG.
    pub fn generate() -> Self {
        let mut wide = [0u8; 64];
        rand::rng().fill_bytes(&mut wide);
        Self::from_wide(&wide)
    }

    /// Deterministic key pair, for tests and simulations.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut wide = [0u8; 64];
        rng.fill_bytes(&mut wide);
        Self::from_wide(&wide)
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        Self {
            secret,
            public: secret.public(),
        }
    }

    fn from_wide(wide: &[u8; 64]) -> Self {
        Self::from_secret(SecretKey(Scalar::from_bytes_mod_order_wide(wide)))
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> Result<Vec<u8>, NetworkError> {
    if s.len() % 2 != 0 {
        return Err(NetworkError::InvalidKey(format!("odd hex length: {}", s.len())));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| NetworkError::InvalidKey(format!("invalid hex: {s}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_keys_are_deterministic() {
        let a = KeyPair::from_seed(7);
        let b = KeyPair::from_seed(7);
        let c = KeyPair::from_seed(8);
        assert_eq!(a.public, b.public);
        assert_ne!(a.public, c.public);
    }

    #[test]
    fn public_hex_roundtrip() {
        let kp = KeyPair::generate();
        let hex = kp.public.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(PublicKey::from_hex(&hex).unwrap(), kp.public);
    }

    #[test]
    fn secret_hex_roundtrip_keeps_public() {
        let kp = KeyPair::from_seed(3);
        let secret = SecretKey::from_hex(&kp.secret.to_hex()).unwrap();
        assert_eq!(KeyPair::from_secret(secret).public, kp.public);
    }

    #[test]
    fn sum_of_keys_matches_addition() {
        let keys: Vec<PublicKey> = (0..4).map(|i| KeyPair::from_seed(i).public).collect();
        let folded = keys[0] + keys[1] + keys[2] + keys[3];
        assert_eq!(keys.iter().sum::<PublicKey>(), folded);
        assert_eq!(Vec::<PublicKey>::new().into_iter().sum::<PublicKey>(), PublicKey::identity());
    }

    #[test]
    fn rejects_bad_encodings() {
        assert!(PublicKey::from_bytes(&[1u8; 5]).is_err());
        assert!(PublicKey::from_hex("zz").is_err());
        assert!(PublicKey::from_hex("abc").is_err());
    }

    #[test]
    fn msgpack_roundtrip() {
        let kp = KeyPair::from_seed(11);
        let bytes = rmp_serde::to_vec(&kp.public).unwrap();
        let back: PublicKey = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, kp.public);
    }
}
