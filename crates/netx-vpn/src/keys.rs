//! Device Key Management
//!
//! X25519 keys for the tunnel, plus the device keypair that binds a key to
//! the `(account id, device id)` pair it was generated for.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Tunnel private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Tunnel public key (Curve25519); also identifies a gateway
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

fn decode_key(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s).map_err(|_| KeyError::InvalidBase64)?;
    bytes.try_into().map_err(|_| KeyError::InvalidLength)
}

/// A key pair (private + public)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

/// Keypair bound to the account and device it was generated for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeypair {
    #[serde(flatten)]
    pub keys: KeyPair,
    pub account_id: String,
    pub device_id: String,
}

impl DeviceKeypair {
    pub fn new(keys: KeyPair, account_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            keys,
            account_id: account_id.into(),
            device_id: device_id.into(),
        }
    }

    /// Was this pair generated for `(account_id, device_id)`?
    pub fn matches(&self, account_id: &str, device_id: &str) -> bool {
        self.account_id == account_id && self.device_id == device_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.keys.private
    }
}

/// Source of fresh keypairs (the native crypto engine on a device)
pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> KeyPair;
}

/// Generates X25519 keys from the OS RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519Generator;

impl KeyGenerator for X25519Generator {
    fn generate(&self) -> KeyPair {
        KeyPair::generate()
    }
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_base64_roundtrip() {
        let keypair = KeyPair::generate();

        let b64 = keypair.private.to_base64();
        let restored = PrivateKey::from_base64(&b64).unwrap();

        assert_eq!(keypair.private, restored);
        assert_eq!(restored.public_key(), keypair.public);
    }

    #[test]
    fn test_invalid_keys() {
        assert_eq!(
            PublicKey::from_base64("not-valid-base64!!!").unwrap_err(),
            KeyError::InvalidBase64
        );
        assert_eq!(
            PublicKey::from_base64("AAAA").unwrap_err(),
            KeyError::InvalidLength
        );
    }

    #[test]
    fn test_private_key_is_redacted() {
        let keypair = KeyPair::generate();
        let debug = format!("{:?}", keypair);

        assert!(!debug.contains(&keypair.private.to_base64()));
        assert!(format!("{:?}", keypair.private).contains("redacted"));
    }

    #[test]
    fn test_device_keypair_binding() {
        let pair = DeviceKeypair::new(X25519Generator.generate(), "acc1", "dev1");

        assert!(pair.matches("acc1", "dev1"));
        assert!(!pair.matches("acc2", "dev1"));
        assert!(!pair.matches("acc1", "dev2"));
    }

    #[test]
    fn test_device_keypair_serde() {
        let pair = DeviceKeypair::new(KeyPair::generate(), "acc1", "dev1");
        let json = serde_json::to_string(&pair).unwrap();

        assert!(json.contains(&pair.public_key().to_base64()));
        let restored: DeviceKeypair = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, pair);
    }
}
