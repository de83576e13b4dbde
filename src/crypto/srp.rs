//! Server side of SRP-6a with the 3072-bit group and SHA-512, as used by Pair Setup.
//!
//! The group prime is the 3072-bit MODP prime from RFC 5054 with generator `g = 5`. Byte-level
//! conventions:
//!
//! * `x = SHA512(salt || SHA512(user || ":" || pass))`
//! * `k = SHA512(N || pad(g))` with `g` left-padded to the prime length
//! * `u = SHA512(A || B)` over the full 384-byte wire representations
//! * the session key hashes the premaster secret with leading zero bytes stripped
//! * `M1` hashes `A` and `B` with leading zero bytes stripped; `M2` hashes the padded `A`
//!
//! Big-number arithmetic is done on `crypto_bigint::U3072` in Montgomery form, which keeps the
//! stack heap-free and the modular exponentiation constant-time with respect to the operands.

use crate::crypto::hash::{sha512, sha512_concat, SHA512_BYTES};
use crate::Error;
use crypto_bigint::modular::runtime_mod::{DynResidue, DynResidueParams};
use crypto_bigint::{Encoding, U3072};
use sha2::{Digest, Sha512};

/// Length of the group prime in bytes.
pub const PRIME_BYTES: usize = 384;
/// Length of the user salt in bytes.
pub const SALT_BYTES: usize = 16;
/// Length of a password verifier in bytes.
pub const VERIFIER_BYTES: usize = PRIME_BYTES;
/// Length of the server's private exponent in bytes.
pub const SECRET_KEY_BYTES: usize = 32;
/// Length of a public key in bytes.
pub const PUBLIC_KEY_BYTES: usize = PRIME_BYTES;
/// Length of the scrambling parameter in bytes.
pub const SCRAMBLING_PARAMETER_BYTES: usize = SHA512_BYTES;
/// Length of the premaster secret in bytes.
pub const PREMASTER_SECRET_BYTES: usize = PRIME_BYTES;
/// Length of the derived session key in bytes.
pub const SESSION_KEY_BYTES: usize = SHA512_BYTES;
/// Length of the M1/M2 proofs in bytes.
pub const PROOF_BYTES: usize = SHA512_BYTES;

/// The 3072-bit MODP group prime (RFC 5054, appendix A).
const N_3072: [u8; PRIME_BYTES] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2,
    0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67,
    0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e,
    0x34, 0x04, 0xdd, 0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5,
    0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff,
    0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed, 0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae,
    0x9f, 0x24, 0x11, 0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
    0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36, 0x1c, 0x55, 0xd3,
    0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f, 0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3,
    0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56, 0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70,
    0x96, 0x96, 0x6d, 0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
    0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b, 0xe3, 0x9e, 0x77,
    0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2, 0xec, 0x07, 0xa2, 0x8f, 0xb5, 0xc5,
    0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9, 0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18, 0x39,
    0x95, 0x49, 0x7c, 0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xaa, 0xc4, 0x2d, 0xad, 0x33, 0x17, 0x0d, 0x04, 0x50, 0x7a,
    0x33, 0xa8, 0x55, 0x21, 0xab, 0xdf, 0x1c, 0xba, 0x64, 0xec, 0xfb, 0x85, 0x04, 0x58, 0xdb,
    0xef, 0x0a, 0x8a, 0xea, 0x71, 0x57, 0x5d, 0x06, 0x0c, 0x7d, 0xb3, 0x97, 0x0f, 0x85, 0xa6,
    0xe1, 0xe4, 0xc7, 0xab, 0xf5, 0xae, 0x8c, 0xdb, 0x09, 0x33, 0xd7, 0x1e, 0x8c, 0x94, 0xe0,
    0x4a, 0x25, 0x61, 0x9d, 0xce, 0xe3, 0xd2, 0x26, 0x1a, 0xd2, 0xee, 0x6b, 0xf1, 0x2f, 0xfa,
    0x06, 0xd9, 0x8a, 0x08, 0x64, 0xd8, 0x76, 0x02, 0x73, 0x3e, 0xc8, 0x6a, 0x64, 0x52, 0x1f,
    0x2b, 0x18, 0x17, 0x7b, 0x20, 0x0c, 0xbb, 0xe1, 0x17, 0x57, 0x7a, 0x61, 0x5d, 0x6c, 0x77,
    0x09, 0x88, 0xc0, 0xba, 0xd9, 0x46, 0xe2, 0x08, 0xe2, 0x4f, 0xa0, 0x74, 0xe5, 0xab, 0x31,
    0x43, 0xdb, 0x5b, 0xfc, 0xe0, 0xfd, 0x10, 0x8e, 0x4b, 0x82, 0xd1, 0x20, 0xa9, 0x3a, 0xd2,
    0xca, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

const GENERATOR: u8 = 5;

fn modulus() -> DynResidueParams<{ U3072::LIMBS }> {
    DynResidueParams::new(&U3072::from_be_slice(&N_3072))
}

fn uint_from_be(bytes: &[u8]) -> U3072 {
    assert!(bytes.len() <= PRIME_BYTES);
    let mut buf = [0; PRIME_BYTES];
    buf[PRIME_BYTES - bytes.len()..].copy_from_slice(bytes);
    U3072::from_be_slice(&buf)
}

fn strip_leading_zeroes(bytes: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < bytes.len() && bytes[i] == 0 {
        i += 1;
    }
    &bytes[i..]
}

/// `x = SHA512(salt || SHA512(user || ":" || pass))`
fn private_key(salt: &[u8; SALT_BYTES], user: &[u8], pass: &[u8]) -> [u8; SHA512_BYTES] {
    let inner = sha512_concat(&[user, b":", pass]);
    sha512_concat(&[salt, &inner])
}

/// `k = SHA512(N || pad(g))`
fn multiplier() -> U3072 {
    let mut padded_g = [0; PRIME_BYTES];
    padded_g[PRIME_BYTES - 1] = GENERATOR;
    uint_from_be(&sha512_concat(&[&N_3072, &padded_g]))
}

/// Computes the password verifier `v = g^x mod N` for a username/password pair.
pub fn verifier(salt: &[u8; SALT_BYTES], user: &[u8], pass: &[u8]) -> [u8; VERIFIER_BYTES] {
    let params = modulus();
    let x = uint_from_be(&private_key(salt, user, pass));
    let g = DynResidue::new(&uint_from_be(&[GENERATOR]), params);
    g.pow(&x).retrieve().to_be_bytes()
}

/// Computes the server public key `B = (k*v + g^b) mod N`.
pub fn public_key(
    b: &[u8; SECRET_KEY_BYTES],
    v: &[u8; VERIFIER_BYTES],
) -> [u8; PUBLIC_KEY_BYTES] {
    let params = modulus();
    let g = DynResidue::new(&uint_from_be(&[GENERATOR]), params);
    let v = DynResidue::new(&uint_from_be(v), params);
    let k = DynResidue::new(&multiplier(), params);
    let gb = g.pow(&uint_from_be(b));
    (k * v + gb).retrieve().to_be_bytes()
}

/// Computes the scrambling parameter `u = SHA512(A || B)`.
pub fn scrambling_parameter(
    pub_a: &[u8; PUBLIC_KEY_BYTES],
    pub_b: &[u8; PUBLIC_KEY_BYTES],
) -> [u8; SCRAMBLING_PARAMETER_BYTES] {
    sha512_concat(&[pub_a, pub_b])
}

/// Computes the premaster secret `S = (A * v^u)^b mod N`.
///
/// Returns `Error::InvalidData` when `A mod N == 0` (RFC 5054, section 2.5.4).
pub fn premaster_secret(
    pub_a: &[u8; PUBLIC_KEY_BYTES],
    b: &[u8; SECRET_KEY_BYTES],
    u: &[u8; SCRAMBLING_PARAMETER_BYTES],
    v: &[u8; VERIFIER_BYTES],
) -> Result<[u8; PREMASTER_SECRET_BYTES], Error> {
    let params = modulus();
    let a = DynResidue::new(&uint_from_be(pub_a), params);
    if a.retrieve() == U3072::ZERO {
        return Err(Error::InvalidData);
    }

    let v = DynResidue::new(&uint_from_be(v), params);
    let s = (a * v.pow(&uint_from_be(u))).pow(&uint_from_be(b));
    Ok(s.retrieve().to_be_bytes())
}

/// Derives the session key `K = SHA512(S)` with leading zero bytes of `S` stripped.
pub fn session_key(s: &[u8; PREMASTER_SECRET_BYTES]) -> [u8; SESSION_KEY_BYTES] {
    sha512(strip_leading_zeroes(s))
}

/// Computes the client proof `M1` the controller is expected to present.
pub fn proof_m1(
    user: &[u8],
    salt: &[u8; SALT_BYTES],
    pub_a: &[u8; PUBLIC_KEY_BYTES],
    pub_b: &[u8; PUBLIC_KEY_BYTES],
    k: &[u8; SESSION_KEY_BYTES],
) -> [u8; PROOF_BYTES] {
    let h_n = sha512(&N_3072);
    let h_g = sha512(&[GENERATOR]);
    let mut h_ng = [0; SHA512_BYTES];
    for i in 0..SHA512_BYTES {
        h_ng[i] = h_n[i] ^ h_g[i];
    }
    let h_user = sha512(user);

    let mut hasher = Sha512::new();
    hasher.update(&h_ng);
    hasher.update(&h_user);
    hasher.update(salt);
    hasher.update(strip_leading_zeroes(pub_a));
    hasher.update(strip_leading_zeroes(pub_b));
    hasher.update(k);
    hasher.finalize().into()
}

/// Computes the server proof `M2 = SHA512(A || M1 || K)`.
pub fn proof_m2(
    pub_a: &[u8; PUBLIC_KEY_BYTES],
    m1: &[u8; PROOF_BYTES],
    k: &[u8; SESSION_KEY_BYTES],
) -> [u8; PROOF_BYTES] {
    sha512_concat(&[pub_a, m1, k])
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_exchange_agrees() {
        let salt = [0x5au8; SALT_BYTES];
        let user = b"Pair-Setup";
        let pass = b"111-22-333";

        let v = verifier(&salt, user, pass);
        let b = [0x21u8; SECRET_KEY_BYTES];
        let pub_b = public_key(&b, &v);

        // Client key pair.
        let a = [0x37u8; 32];
        let pub_a = client::public_key(&a);

        let u = scrambling_parameter(&pub_a, &pub_b);
        let server_s = premaster_secret(&pub_a, &b, &u, &v).unwrap();
        let x = client::private_key(&salt, user, pass);
        let client_s = client::premaster_secret(&a, &pub_b, &u, &x);
        assert_eq!(server_s[..], client_s[..]);

        let key = session_key(&server_s);
        let m1 = proof_m1(user, &salt, &pub_a, &pub_b, &key);
        let m2 = proof_m2(&pub_a, &m1, &key);
        assert_ne!(m1, m2);
    }

    #[test]
    fn verifier_differs_by_password() {
        let salt = [1u8; SALT_BYTES];
        let v1 = verifier(&salt, b"Pair-Setup", b"111-22-333");
        let v2 = verifier(&salt, b"Pair-Setup", b"111-22-334");
        assert_ne!(v1[..], v2[..]);
    }

    #[test]
    fn zero_public_key_is_rejected() {
        let salt = [2u8; SALT_BYTES];
        let v = verifier(&salt, b"Pair-Setup", b"111-22-333");
        let b = [3u8; SECRET_KEY_BYTES];
        let u = [4u8; SCRAMBLING_PARAMETER_BYTES];

        let zero = [0u8; PUBLIC_KEY_BYTES];
        assert_eq!(premaster_secret(&zero, &b, &u, &v), Err(Error::InvalidData));

        // A == N is 0 mod N as well.
        assert_eq!(
            premaster_secret(&N_3072, &b, &u, &v),
            Err(Error::InvalidData)
        );
    }
}
