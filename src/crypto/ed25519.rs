//! Ed25519 signatures over the accessory's long-term identity.
//!
//! Backed by `ed25519-dalek`, whose RFC 8032 deterministic signing replaces the random-seed
//! blinding of dedicated embedded implementations while providing equivalent side-channel
//! hardening.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Length of an Ed25519 secret key in bytes.
pub const SECRET_KEY_BYTES: usize = 32;
/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_BYTES: usize = 32;
/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_BYTES: usize = 64;

/// Derives the public key belonging to `sk`.
pub fn public_key(sk: &[u8; SECRET_KEY_BYTES]) -> [u8; PUBLIC_KEY_BYTES] {
    SigningKey::from_bytes(sk).verifying_key().to_bytes()
}

/// Signs `msg` with `sk`.
pub fn sign(msg: &[u8], sk: &[u8; SECRET_KEY_BYTES]) -> [u8; SIGNATURE_BYTES] {
    SigningKey::from_bytes(sk).sign(msg).to_bytes()
}

/// Verifies that `sig` is a valid signature of `msg` under `pk`.
pub fn verify(sig: &[u8; SIGNATURE_BYTES], msg: &[u8], pk: &[u8; PUBLIC_KEY_BYTES]) -> bool {
    let pk = match VerifyingKey::from_bytes(pk) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    pk.verify(msg, &Signature::from_bytes(sig)).is_ok()
}
