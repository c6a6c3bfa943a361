//! Key material handle
//!
//! `Keys` owns a secp256k1 secret key for the lifetime of a client. The secret
//! is zeroized on drop, is never serialized and is redacted from `Debug`.

use core::fmt;

use rand::RngCore;

use crate::errors::{NametagError, Result};
use crate::schnorr::{self, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE};

/// Signing identity: secret key plus its x-only public key
#[derive(Clone)]
pub struct Keys {
    secret: k256::SecretKey,
    public_key: [u8; PUBLIC_KEY_SIZE],
}

impl Keys {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        loop {
            let mut bytes = [0u8; SECRET_KEY_SIZE];
            rng.fill_bytes(&mut bytes);
            if let Ok(keys) = Self::from_secret_bytes(&bytes) {
                return keys;
            }
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let public_key = schnorr::derive_public_key(bytes)?;
        let secret = k256::SecretKey::from_slice(bytes)
            .map_err(|_| NametagError::invalid_input("private key is not a valid scalar"))?;
        Ok(Self { secret, public_key })
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| NametagError::invalid_input(format!("private key hex: {e}")))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    /// Raw secret bytes, for handing to an encryption primitive
    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        let mut out = [0u8; SECRET_KEY_SIZE];
        out.copy_from_slice(&self.secret.to_bytes());
        out
    }

    /// BIP-340 signature over a 32-byte message
    pub fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_SIZE]> {
        schnorr::sign(message, &self.secret.to_bytes())
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl PartialEq for Keys {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for Keys {}

/// Decode and validate a hex x-only public key
pub fn parse_public_key(public_key_hex: &str) -> Result<[u8; PUBLIC_KEY_SIZE]> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| NametagError::invalid_input(format!("public key hex: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        NametagError::invalid_input(format!(
            "public key must be {} bytes, got {}",
            PUBLIC_KEY_SIZE,
            bytes.len()
        ))
    })
}
