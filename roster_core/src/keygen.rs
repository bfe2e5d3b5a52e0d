//! Curve25519 key generation matching `wg genkey` / `wg pubkey` / `wg genpsk`.

use crate::keys::{Key, SecretKey, KEY_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey as DalekPublicKey, StaticSecret};
use zeroize::Zeroize;

/// A freshly generated device or user key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    private_key: SecretKey,
    public_key: Key,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        clamp(&mut bytes);
        let private_key = SecretKey::from_bytes(bytes);
        bytes.zeroize();
        Self::from_private_key(private_key)
    }

    pub fn from_private_key(private_key: SecretKey) -> Self {
        let public_key = public_key_for(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    pub fn private_key(&self) -> &SecretKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &Key {
        &self.public_key
    }

    pub fn into_private_key(self) -> SecretKey {
        self.private_key
    }
}

/// Derive the public key for a private key.
pub fn public_key_for(private_key: &SecretKey) -> Key {
    let secret = StaticSecret::from(*private_key.expose_bytes());
    Key::from_bytes(DalekPublicKey::from(&secret).to_bytes())
}

/// 32 random bytes, as produced by `wg genpsk`.
pub fn generate_preshared_key() -> SecretKey {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    let psk = SecretKey::from_bytes(bytes);
    bytes.zeroize();
    psk
}

fn clamp(bytes: &mut [u8; KEY_LEN]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}
