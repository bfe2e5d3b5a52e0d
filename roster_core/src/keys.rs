//! Key codec for WireGuard key material.
//!
//! WireGuard keys travel as standard (padded) base64 strings that decode to
//! exactly 32 bytes. [`Key`] is used for public identities and is freely
//! copyable and printable; [`SecretKey`] holds private and preshared keys,
//! redacts itself in `Debug` output and wipes its bytes on drop.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroize;

/// Length in bytes of every WireGuard key.
pub const KEY_LEN: usize = 32;

/// Errors produced when decoding key strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("key must decode to {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

fn decode_key_bytes(input: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let mut decoded = STANDARD.decode(input.trim())?;
    let result = <[u8; KEY_LEN]>::try_from(decoded.as_slice()).map_err(|_| KeyError::Length {
        expected: KEY_LEN,
        actual: decoded.len(),
    });
    decoded.zeroize();
    result
}

/// A 32-byte public key. Identity of a peer on the tunnel device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LEN]);

/// Public keys identify peers; the alias keeps signatures readable.
pub type PublicKey = Key;

impl Key {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a base64 key string. Surrounding whitespace is ignored.
    pub fn from_base64(input: &str) -> Result<Self, KeyError> {
        decode_key_bytes(input).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_base64())
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Key::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Secret key material (device private keys, preshared keys).
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LEN]);

/// Preshared keys share the secret representation.
pub type PresharedKey = SecretKey;

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a base64 secret. Surrounding whitespace is ignored.
    pub fn from_base64(input: &str) -> Result<Self, KeyError> {
        decode_key_bytes(input).map(Self)
    }

    pub fn expose_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encode the secret. The caller is responsible for not logging it.
    pub fn expose_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl FromStr for SecretKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";

    #[test]
    fn parses_valid_key() {
        let key = Key::from_base64(SAMPLE).unwrap();
        assert_eq!(key.to_base64(), SAMPLE);
        assert_eq!(key.to_string(), SAMPLE);
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let key = Key::from_base64(&format!("  {SAMPLE}\n")).unwrap();
        assert_eq!(key.to_base64(), SAMPLE);
    }

    #[test]
    fn rejects_short_input() {
        let short = STANDARD.encode([7u8; 16]);
        assert_eq!(
            Key::from_base64(&short),
            Err(KeyError::Length {
                expected: KEY_LEN,
                actual: 16
            })
        );
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(
            Key::from_base64(""),
            Err(KeyError::Length { actual: 0, .. })
        ));
    }

    #[test]
    fn rejects_bad_alphabet() {
        assert!(matches!(
            Key::from_base64("not*a*key*at*all"),
            Err(KeyError::Encoding(_))
        ));
        assert!(matches!(
            Key::from_base64("Ab12...=="),
            Err(KeyError::Encoding(_))
        ));
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SecretKey::from_base64(SAMPLE).unwrap();
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains(SAMPLE));
        assert_eq!(secret.expose_base64(), SAMPLE);
    }

    #[test]
    fn serde_uses_base64() {
        let key = Key::from_base64(SAMPLE).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{SAMPLE}\""));
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<Key>("\"AAAA\"").is_err());
    }

    proptest! {
        #[test]
        fn any_32_bytes_parse_back(bytes in proptest::array::uniform32(any::<u8>())) {
            let encoded = STANDARD.encode(bytes);
            let key = Key::from_base64(&encoded).unwrap();
            prop_assert_eq!(key.as_bytes(), &bytes);
        }

        #[test]
        fn wrong_lengths_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assume!(bytes.len() != KEY_LEN);
            let encoded = STANDARD.encode(&bytes);
            let is_length_error = matches!(
                Key::from_base64(&encoded),
                Err(KeyError::Length { .. })
            );
            prop_assert!(is_length_error);
        }
    }
}
