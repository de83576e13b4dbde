//! X25519 Diffie-Hellman used by Pair Verify.

use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};

/// Length of an X25519 point or shared secret in bytes.
pub const KEY_BYTES: usize = 32;
/// Length of an X25519 scalar in bytes.
pub const SCALAR_BYTES: usize = 32;

/// Multiplies the curve base point by `scalar`, producing a public key.
pub fn scalarmult_base(scalar: &[u8; SCALAR_BYTES]) -> [u8; KEY_BYTES] {
    x25519(*scalar, X25519_BASEPOINT_BYTES)
}

/// Multiplies `point` by `scalar`, producing a shared secret.
pub fn scalarmult(scalar: &[u8; SCALAR_BYTES], point: &[u8; KEY_BYTES]) -> [u8; KEY_BYTES] {
    x25519(*scalar, *point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement() {
        let a = [0x11u8; SCALAR_BYTES];
        let b = [0x22u8; SCALAR_BYTES];
        let a_pub = scalarmult_base(&a);
        let b_pub = scalarmult_base(&b);
        assert_ne!(a_pub, b_pub);
        assert_eq!(scalarmult(&a, &b_pub), scalarmult(&b, &a_pub));
    }

    #[test]
    fn rfc7748_base_point_vector() {
        // RFC 7748 section 6.1, Alice's key pair.
        let scalar = [
            0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
            0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
            0x1d, 0xb9, 0x2c, 0x2a,
        ];
        let expected = [
            0x85, 0x20, 0xf0, 0x09, 0x89, 0x30, 0xa7, 0x54, 0x74, 0x8b, 0x7d, 0xdc, 0xb4, 0x3e,
            0xf7, 0x5a, 0x0d, 0xbf, 0x3a, 0x0d, 0x26, 0x38, 0x1a, 0xf4, 0xeb, 0xa4, 0xa9, 0x8e,
            0xaa, 0x9b, 0x4e, 0x6a,
        ];
        assert_eq!(scalarmult_base(&scalar), expected);
    }
}
