//! BIP-340 Schnorr signatures over secp256k1
//!
//! Field and group arithmetic come from `k256`; the signing procedure itself
//! follows BIP-340 with a deterministic nonce (no auxiliary randomness), so
//! the same key and message always produce the same signature.

use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::point::{AffineCoordinates, DecompressPoint};
use k256::elliptic_curve::subtle::Choice;
use k256::elliptic_curve::{Group, PrimeField};
use k256::{AffinePoint, FieldBytes, ProjectivePoint, Scalar, U256};
use sha2::{Digest, Sha256};

use crate::errors::{NametagError, Result};

pub const SECRET_KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const MESSAGE_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

const NONCE_TAG: &str = "BIP0340/nonce";
const CHALLENGE_TAG: &str = "BIP0340/challenge";

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------

/// Domain-separated hash: `SHA256(SHA256(tag) || SHA256(tag) || msg)`
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

fn challenge(r_x: &[u8], p_x: &[u8], msg: &[u8]) -> Scalar {
    let mut buf = Vec::with_capacity(96);
    buf.extend_from_slice(r_x);
    buf.extend_from_slice(p_x);
    buf.extend_from_slice(msg);
    let e = tagged_hash(CHALLENGE_TAG, &buf);
    <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(&e))
}

// ----------------------------------------------------------------------------
// Key Handling
// ----------------------------------------------------------------------------

fn secret_scalar(private_key: &[u8]) -> Result<Scalar> {
    if private_key.len() != SECRET_KEY_SIZE {
        return Err(NametagError::invalid_input(format!(
            "private key must be {} bytes, got {}",
            SECRET_KEY_SIZE,
            private_key.len()
        )));
    }
    let scalar: Option<Scalar> = Scalar::from_repr(*FieldBytes::from_slice(private_key)).into();
    match scalar {
        Some(d) if d != Scalar::ZERO => Ok(d),
        _ => Err(NametagError::invalid_input(
            "private key is outside the range [1, n-1]",
        )),
    }
}

fn x_bytes(point: &AffinePoint) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&point.x());
    out
}

/// Derive the 32-byte x-only public key for `private_key`
pub fn derive_public_key(private_key: &[u8]) -> Result<[u8; PUBLIC_KEY_SIZE]> {
    let d = secret_scalar(private_key)?;
    let point = (ProjectivePoint::GENERATOR * d).to_affine();
    Ok(x_bytes(&point))
}

/// Lift an x-only key to the curve point with even y
fn lift_x(public_key: &[u8]) -> Option<AffinePoint> {
    if public_key.len() != PUBLIC_KEY_SIZE {
        return None;
    }
    AffinePoint::decompress(FieldBytes::from_slice(public_key), Choice::from(0)).into()
}

// ----------------------------------------------------------------------------
// Sign / Verify
// ----------------------------------------------------------------------------

/// Sign a 32-byte message, returning `R.x || s`
pub fn sign(message: &[u8], private_key: &[u8]) -> Result<[u8; SIGNATURE_SIZE]> {
    if message.len() != MESSAGE_SIZE {
        return Err(NametagError::invalid_input(format!(
            "message must be {} bytes, got {}",
            MESSAGE_SIZE,
            message.len()
        )));
    }
    let d0 = secret_scalar(private_key)?;

    let p = (ProjectivePoint::GENERATOR * d0).to_affine();
    let d = if bool::from(p.y_is_odd()) { -d0 } else { d0 };
    let p_x = x_bytes(&p);

    let mut nonce_input = Vec::with_capacity(96);
    nonce_input.extend_from_slice(&d.to_bytes());
    nonce_input.extend_from_slice(&p_x);
    nonce_input.extend_from_slice(message);
    let nonce = tagged_hash(NONCE_TAG, &nonce_input);
    let k0 = <Scalar as Reduce<U256>>::reduce_bytes(FieldBytes::from_slice(&nonce));
    if k0 == Scalar::ZERO {
        return Err(NametagError::Signing("derived nonce is zero".into()));
    }

    let r = (ProjectivePoint::GENERATOR * k0).to_affine();
    let k = if bool::from(r.y_is_odd()) { -k0 } else { k0 };
    let r_x = x_bytes(&r);

    let e = challenge(&r_x, &p_x, message);
    let s = k + e * d;

    let mut signature = [0u8; SIGNATURE_SIZE];
    signature[..32].copy_from_slice(&r_x);
    signature[32..].copy_from_slice(&s.to_bytes());
    Ok(signature)
}

/// Verify a BIP-340 signature against an x-only public key
///
/// Malformed inputs (wrong lengths, keys off the curve, out-of-range `s`)
/// verify as `false`.
pub fn verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    if message.len() != MESSAGE_SIZE || signature.len() != SIGNATURE_SIZE {
        return false;
    }
    let Some(p) = lift_x(public_key) else {
        return false;
    };
    let (r_x, s_bytes) = signature.split_at(32);
    let s: Option<Scalar> = Scalar::from_repr(*FieldBytes::from_slice(s_bytes)).into();
    let Some(s) = s else {
        return false;
    };

    let e = challenge(r_x, public_key, message);
    let r = ProjectivePoint::GENERATOR * s - ProjectivePoint::from(p) * e;
    if bool::from(r.is_identity()) {
        return false;
    }
    let r = r.to_affine();
    !bool::from(r.y_is_odd()) && x_bytes(&r).as_slice() == r_x
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::schnorr::signature::hazmat::PrehashVerifier;
    use k256::schnorr::{Signature, VerifyingKey};
    use proptest::prelude::*;

    fn scalar_bytes(n: u8) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[31] = n;
        bytes
    }

    #[test]
    fn test_derive_public_key_generator() {
        let pk = derive_public_key(&scalar_bytes(1)).unwrap();
        assert_eq!(
            hex::encode_upper(pk),
            "79BE667EF9DCBBAC55A06295CE870B07029BFCDB2DCE28D959F2815B16F81798"
        );
    }

    #[test]
    fn test_derive_public_key_bip340_vector() {
        let pk = derive_public_key(&scalar_bytes(3)).unwrap();
        assert_eq!(
            hex::encode_upper(pk),
            "F9308A019258C31049344F85F89D5229B531C845836F99B08601F113BCE036F9"
        );
    }

    #[test]
    fn test_verify_bip340_vector_zero() {
        let pk = hex::decode("F9308A019258C31049344F85F89D5229B531C845836F99B08601F113BCE036F9")
            .unwrap();
        let sig = hex::decode(
            "E907831F80848D1069A5371B402410364BDF1C5F8307B0084C55F1CE2DCA8215\
             25F66A4A85EA8B71E482A74F382D2CE5EBEEE8FDB2172F477DF4900D310536C0",
        )
        .unwrap();
        assert!(verify(&[0u8; 32], &sig, &pk));

        let mut tampered = sig.clone();
        tampered[63] ^= 0x01;
        assert!(!verify(&[0u8; 32], &tampered, &pk));
    }

    #[test]
    fn test_sign_rejects_bad_lengths() {
        let sk = scalar_bytes(7);
        assert!(matches!(
            sign(&[0u8; 31], &sk),
            Err(NametagError::InvalidInput(_))
        ));
        assert!(matches!(
            sign(&[0u8; 32], &sk[..16]),
            Err(NametagError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_zero_and_overflowing_keys_rejected() {
        assert!(derive_public_key(&[0u8; 32]).is_err());
        assert!(derive_public_key(&[0xFF; 32]).is_err());
    }

    #[test]
    fn test_sign_is_deterministic() {
        let sk = scalar_bytes(42);
        let msg = [9u8; 32];
        assert_eq!(sign(&msg, &sk).unwrap(), sign(&msg, &sk).unwrap());
    }

    #[test]
    fn test_verify_rejects_wrong_key_and_message() {
        let msg = [1u8; 32];
        let sig = sign(&msg, &scalar_bytes(5)).unwrap();
        let other = derive_public_key(&scalar_bytes(6)).unwrap();
        assert!(!verify(&msg, &sig, &other));

        let pk = derive_public_key(&scalar_bytes(5)).unwrap();
        assert!(!verify(&[2u8; 32], &sig, &pk));
        assert!(!verify(&msg, &sig[..63], &pk));
    }

    #[test]
    fn test_odd_y_key_signs_under_x_only_key() {
        let sk = (1..=32u8)
            .map(scalar_bytes)
            .find(|sk| {
                let d = secret_scalar(sk).unwrap();
                bool::from((ProjectivePoint::GENERATOR * d).to_affine().y_is_odd())
            })
            .unwrap();
        let msg = [0x5Au8; 32];
        let sig = sign(&msg, &sk).unwrap();
        let pk = derive_public_key(&sk).unwrap();
        assert!(verify(&msg, &sig, &pk));
    }

    #[test]
    fn test_tagged_hash_prefix() {
        let direct = {
            let tag = Sha256::digest(b"BIP0340/challenge");
            let mut h = Sha256::new();
            h.update(tag);
            h.update(tag);
            h.update(b"abc");
            let out: [u8; 32] = h.finalize().into();
            out
        };
        assert_eq!(tagged_hash("BIP0340/challenge", b"abc"), direct);
    }

    proptest! {
        #[test]
        fn prop_sign_verify_round_trip(seed in any::<[u8; 32]>(), msg in any::<[u8; 32]>()) {
            prop_assume!(secret_scalar(&seed).is_ok());
            let sig = sign(&msg, &seed).unwrap();
            let pk = derive_public_key(&seed).unwrap();
            prop_assert!(verify(&msg, &sig, &pk));
        }

        #[test]
        fn prop_signatures_verify_with_k256(seed in any::<[u8; 32]>(), msg in any::<[u8; 32]>()) {
            prop_assume!(secret_scalar(&seed).is_ok());
            let sig = sign(&msg, &seed).unwrap();
            let pk = derive_public_key(&seed).unwrap();
            let vk = VerifyingKey::from_bytes(&pk).unwrap();
            let sig = Signature::try_from(sig.as_slice()).unwrap();
            prop_assert!(vk.verify_prehash(&msg, &sig).is_ok());
        }
    }
}
