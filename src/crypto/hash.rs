//! Digest, MAC and key derivation functions.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Length of a SHA-1 digest in bytes.
pub const SHA1_BYTES: usize = 20;
/// Length of a SHA-256 digest in bytes.
pub const SHA256_BYTES: usize = 32;
/// Length of a SHA-512 digest in bytes.
pub const SHA512_BYTES: usize = 64;
/// Length of an HMAC-SHA1 tag in bytes.
pub const HMAC_SHA1_BYTES: usize = 20;

/// Computes the SHA-1 digest of `data`.
pub fn sha1(data: &[u8]) -> [u8; SHA1_BYTES] {
    Sha1::digest(data).into()
}

/// Computes the SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; SHA256_BYTES] {
    Sha256::digest(data).into()
}

/// Computes the SHA-512 digest of `data`.
pub fn sha512(data: &[u8]) -> [u8; SHA512_BYTES] {
    Sha512::digest(data).into()
}

/// Computes the SHA-512 digest of the concatenation of `parts`.
pub fn sha512_concat(parts: &[&[u8]]) -> [u8; SHA512_BYTES] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Computes `HMAC-SHA1(key, msg || aad)`.
pub fn hmac_sha1_aad(key: &[u8], msg: &[u8], aad: &[u8]) -> [u8; HMAC_SHA1_BYTES] {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.update(aad);
    mac.finalize().into_bytes().into()
}

/// Derives `out.len()` bytes with HKDF-SHA512.
pub fn hkdf_sha512(key: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) {
    let hk = hkdf::Hkdf::<Sha512>::new(Some(salt), key);
    hk.expand(info, out).expect("HKDF output length in range");
}

/// Derives `out.len()` bytes with PBKDF2-HMAC-SHA1.
pub fn pbkdf2_hmac_sha1(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha512_abc() {
        // FIPS 180-2 test vector.
        let digest = sha512(b"abc");
        assert_eq!(
            &digest[..8],
            &[0xdd, 0xaf, 0x35, 0xa1, 0x93, 0x61, 0x7a, 0xba]
        );
        assert_eq!(&digest[56..], &[0x45, 0x4d, 0x44, 0x23, 0x64, 0x3c, 0xe8, 0x0e]);
    }

    #[test]
    fn sha1_abc() {
        // FIPS 180-1 test vector.
        assert_eq!(
            sha1(b"abc"),
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }

    #[test]
    fn concat_matches_single_shot() {
        assert_eq!(sha512_concat(&[b"ab", b"c"]), sha512(b"abc"));
    }

    #[test]
    fn hkdf_known_length() {
        let mut out = [0u8; 32];
        hkdf_sha512(b"key", b"salt", b"info", &mut out);
        assert_ne!(out, [0u8; 32]);

        let mut out2 = [0u8; 32];
        hkdf_sha512(b"key", b"salt", b"info", &mut out2);
        assert_eq!(out, out2);

        let mut out3 = [0u8; 32];
        hkdf_sha512(b"key", b"salt", b"other", &mut out3);
        assert_ne!(out, out3);
    }

    #[test]
    fn pbkdf2_rfc6070_vector() {
        // RFC 6070 test vector 2.
        let mut out = [0u8; 20];
        pbkdf2_hmac_sha1(b"password", b"salt", 2, &mut out);
        assert_eq!(
            out,
            [
                0xea, 0x6c, 0x01, 0x4d, 0xc7, 0x2d, 0x6f, 0x8c, 0xcd, 0x1e, 0xd9, 0x2a, 0xce,
                0x1d, 0x41, 0xf0, 0xd8, 0xde, 0x89, 0x57
            ]
        );
    }
}
