//! Payload encryption for recipient messages
//!
//! [`Nip04Cipher`] is the default: NIP-04 shared-secret encryption over the
//! ECDH of the two keys. Large plaintexts are gzip-compressed first and carried
//! under a `gz:` marker so both sides agree on the framing.
//!
//! [`HexCodec`] reproduces the legacy hex "encryption" older peers still emit.
//! It provides no confidentiality.

use std::io::{Read, Write};

use base64::engine::general_purpose;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nametag_core::{Keys, NametagError, Result};
use nostr_sdk::nips::nip04;
use nostr_sdk::{PublicKey, SecretKey};
use tracing::trace;

use crate::config::DEFAULT_COMPRESSION_THRESHOLD;

const COMPRESSED_PREFIX: &str = "gz:";

/// Turns opaque payloads into event content and back
pub trait ContentCipher: Send + Sync + 'static {
    /// Encrypt `plaintext` from `sender` to the x-only key `recipient_hex`
    fn encrypt(&self, plaintext: &str, recipient_hex: &str, sender: &Keys) -> Result<String>;

    /// Decrypt `ciphertext` sent by `sender_hex` to `recipient`
    fn decrypt(&self, ciphertext: &str, sender_hex: &str, recipient: &Keys) -> Result<String>;
}

// ----------------------------------------------------------------------------
// NIP-04
// ----------------------------------------------------------------------------

/// NIP-04 encryption with gzip for large payloads
#[derive(Debug, Clone)]
pub struct Nip04Cipher {
    compression_threshold: usize,
}

impl Default for Nip04Cipher {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl Nip04Cipher {
    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
        }
    }

    fn secret_key(keys: &Keys) -> Result<SecretKey> {
        SecretKey::from_slice(&keys.secret_bytes())
            .map_err(|e| NametagError::Encryption(format!("secret key: {e}")))
    }

    fn public_key(public_key_hex: &str) -> Result<PublicKey> {
        PublicKey::from_hex(public_key_hex)
            .map_err(|e| NametagError::Encryption(format!("public key {public_key_hex}: {e}")))
    }

    fn pack(&self, plaintext: &str) -> Result<String> {
        // A short plaintext that already looks packed is compressed anyway
        if plaintext.len() <= self.compression_threshold
            && !plaintext.starts_with(COMPRESSED_PREFIX)
        {
            return Ok(plaintext.to_string());
        }
        let compress = |text: &str| -> std::io::Result<Vec<u8>> {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(text.as_bytes())?;
            encoder.finish()
        };
        let compressed = compress(plaintext)
            .map_err(|e| NametagError::Encryption(format!("compression failed: {e}")))?;
        trace!(
            "Compressed payload {} -> {} bytes",
            plaintext.len(),
            compressed.len()
        );
        Ok(format!(
            "{COMPRESSED_PREFIX}{}",
            general_purpose::STANDARD.encode(compressed)
        ))
    }

    fn unpack(packed: String) -> Result<String> {
        let Some(encoded) = packed.strip_prefix(COMPRESSED_PREFIX) else {
            return Ok(packed);
        };
        let compressed = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| NametagError::Encryption(format!("compressed payload: {e}")))?;
        let mut plaintext = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut plaintext)
            .map_err(|e| NametagError::Encryption(format!("decompression failed: {e}")))?;
        Ok(plaintext)
    }
}

impl ContentCipher for Nip04Cipher {
    fn encrypt(&self, plaintext: &str, recipient_hex: &str, sender: &Keys) -> Result<String> {
        let secret_key = Self::secret_key(sender)?;
        let recipient = Self::public_key(recipient_hex)?;
        let packed = self.pack(plaintext)?;
        nip04::encrypt(&secret_key, &recipient, packed)
            .map_err(|e| NametagError::Encryption(format!("NIP-04 encryption failed: {e}")))
    }

    fn decrypt(&self, ciphertext: &str, sender_hex: &str, recipient: &Keys) -> Result<String> {
        let secret_key = Self::secret_key(recipient)?;
        let sender = Self::public_key(sender_hex)?;
        let packed = nip04::decrypt(&secret_key, &sender, ciphertext)
            .map_err(|e| NametagError::Encryption(format!("NIP-04 decryption failed: {e}")))?;
        Self::unpack(packed)
    }
}

// ----------------------------------------------------------------------------
// Legacy Hex
// ----------------------------------------------------------------------------

/// Hex encoding of the UTF-8 payload, keys unused
#[derive(Debug, Clone, Copy, Default)]
pub struct HexCodec;

impl ContentCipher for HexCodec {
    fn encrypt(&self, plaintext: &str, _recipient_hex: &str, _sender: &Keys) -> Result<String> {
        Ok(hex::encode(plaintext.as_bytes()))
    }

    fn decrypt(&self, ciphertext: &str, _sender_hex: &str, _recipient: &Keys) -> Result<String> {
        let bytes = hex::decode(ciphertext)
            .map_err(|e| NametagError::Encryption(format!("hex payload: {e}")))?;
        String::from_utf8(bytes).map_err(|e| NametagError::Encryption(format!("hex payload: {e}")))
    }
}
