//! ChaCha20-Poly1305 authenticated encryption.
//!
//! Both a one-shot interface (used for all session traffic) and a streaming interface (init /
//! update AAD / update / finalize) are provided. The streaming variant is the RFC 8439
//! construction assembled from the `chacha20` and `poly1305` crates so data can be processed in
//! fragments without buffering the whole message.
//!
//! Nonces may be 1 to 12 bytes long; short nonces are padded with leading zero bytes, so the
//! nonce occupies the trailing (low-order) positions. Session counters use an 8-byte
//! little-endian nonce with a 4-byte zero prefix.

use crate::crypto::constant_time_eq;
use crate::Error;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use poly1305::universal_hash::{KeyInit as _, UniversalHash};
use poly1305::Poly1305;

/// Length of a ChaCha20-Poly1305 key in bytes.
pub const KEY_BYTES: usize = 32;
/// Maximum nonce length in bytes.
pub const NONCE_BYTES: usize = 12;
/// Length of the Poly1305 authentication tag in bytes.
pub const TAG_BYTES: usize = 16;

fn pad_nonce(nonce: &[u8]) -> [u8; NONCE_BYTES] {
    assert!(!nonce.is_empty() && nonce.len() <= NONCE_BYTES);
    let mut padded = [0; NONCE_BYTES];
    padded[NONCE_BYTES - nonce.len()..].copy_from_slice(nonce);
    padded
}

/// Encrypts `buf` in place and returns the authentication tag.
pub fn encrypt(
    key: &[u8; KEY_BYTES],
    nonce: &[u8],
    aad: &[u8],
    buf: &mut [u8],
) -> [u8; TAG_BYTES] {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = pad_nonce(nonce);
    let tag = cipher
        .encrypt_in_place_detached((&nonce).into(), aad, buf)
        .expect("plaintext length in range");
    tag.into()
}

/// Decrypts `buf` in place after verifying the authentication tag.
///
/// The tag comparison is constant time. On mismatch, `buf` contents are unspecified and
/// `Error::InvalidData` is returned.
pub fn decrypt(
    key: &[u8; KEY_BYTES],
    nonce: &[u8],
    aad: &[u8],
    buf: &mut [u8],
    tag: &[u8; TAG_BYTES],
) -> Result<(), Error> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = pad_nonce(nonce);
    cipher
        .decrypt_in_place_detached((&nonce).into(), aad, buf, tag.into())
        .map_err(|_| Error::InvalidData)
}

/// Accumulates MAC input in 16-byte blocks, zero-padding each section per RFC 8439.
struct MacSections {
    mac: Poly1305,
    pending: [u8; 16],
    pending_len: usize,
}

impl MacSections {
    fn new(mac: Poly1305) -> Self {
        MacSections {
            mac,
            pending: [0; 16],
            pending_len: 0,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = core::cmp::min(16 - self.pending_len, data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len == 16 {
                let block = self.pending;
                self.mac.update_padded(&block);
                self.pending_len = 0;
            }
        }
        let full = data.len() - data.len() % 16;
        if full > 0 {
            self.mac.update_padded(&data[..full]);
        }
        let rest = &data[full..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    /// Flushes a partially filled block, zero-padded to 16 bytes.
    fn end_section(&mut self) {
        if self.pending_len > 0 {
            self.mac.update_padded(&self.pending[..self.pending_len]);
            self.pending_len = 0;
        }
    }
}

/// Streaming ChaCha20-Poly1305 context.
///
/// All AAD must be supplied before the first data update. The same context type serves both
/// directions; encryption feeds produced ciphertext to the MAC, decryption feeds consumed
/// ciphertext.
pub struct AeadContext {
    cipher: ChaCha20,
    mac: MacSections,
    aad_len: u64,
    msg_len: u64,
    aad_done: bool,
}

impl AeadContext {
    /// Creates a streaming context for the given key and (1..=12 byte) nonce.
    pub fn new(key: &[u8; KEY_BYTES], nonce: &[u8]) -> Self {
        let nonce = pad_nonce(nonce);
        let mut cipher = ChaCha20::new(key.into(), (&nonce).into());

        // The Poly1305 key is the first half of the initial keystream block; the rest of the
        // block is discarded and data starts at block counter 1.
        let mut block = [0; 64];
        cipher.apply_keystream(&mut block);
        let mac = Poly1305::new(poly1305::Key::from_slice(&block[..32]));

        AeadContext {
            cipher,
            mac: MacSections::new(mac),
            aad_len: 0,
            msg_len: 0,
            aad_done: false,
        }
    }

    /// Feeds additional authenticated data. Must precede all data updates.
    pub fn update_aad(&mut self, aad: &[u8]) {
        assert!(!self.aad_done, "AAD must precede data");
        self.aad_len += aad.len() as u64;
        self.mac.update(aad);
    }

    fn finish_aad(&mut self) {
        if !self.aad_done {
            self.mac.end_section();
            self.aad_done = true;
        }
    }

    /// Encrypts `buf` in place, accumulating the produced ciphertext into the tag.
    pub fn update_encrypt(&mut self, buf: &mut [u8]) {
        self.finish_aad();
        self.cipher.apply_keystream(buf);
        self.msg_len += buf.len() as u64;
        self.mac.update(buf);
    }

    /// Decrypts `buf` in place, accumulating the consumed ciphertext into the tag.
    pub fn update_decrypt(&mut self, buf: &mut [u8]) {
        self.finish_aad();
        self.msg_len += buf.len() as u64;
        self.mac.update(buf);
        self.cipher.apply_keystream(buf);
    }

    fn tag(mut self) -> [u8; TAG_BYTES] {
        self.finish_aad();
        self.mac.end_section();
        let mut lengths = [0; 16];
        lengths[..8].copy_from_slice(&self.aad_len.to_le_bytes());
        lengths[8..].copy_from_slice(&self.msg_len.to_le_bytes());
        self.mac.update(&lengths);
        self.mac.mac.finalize().into()
    }

    /// Finishes encryption and returns the authentication tag.
    pub fn finalize_encrypt(self) -> [u8; TAG_BYTES] {
        self.tag()
    }

    /// Finishes decryption, comparing the computed tag against `tag` in constant time.
    pub fn finalize_decrypt(self, tag: &[u8; TAG_BYTES]) -> Result<(), Error> {
        let computed = self.tag();
        if constant_time_eq(&computed, tag) {
            Ok(())
        } else {
            Err(Error::InvalidData)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_BYTES] = [0x42; KEY_BYTES];

    #[test]
    fn round_trip_with_aad() {
        let mut buf = *b"status characteristic value";
        let tag = encrypt(&KEY, &[1, 2, 3, 4], b"aad", &mut buf);
        assert_ne!(&buf[..], b"status characteristic value");

        decrypt(&KEY, &[1, 2, 3, 4], b"aad", &mut buf, &tag).unwrap();
        assert_eq!(&buf[..], b"status characteristic value");
    }

    #[test]
    fn bit_flips_fail_authentication() {
        let mut buf = *b"frame";
        let tag = encrypt(&KEY, b"PV-Msg02", &[], &mut buf);

        let mut flipped = buf;
        flipped[0] ^= 0x80;
        let mut scratch = flipped;
        assert_eq!(
            decrypt(&KEY, b"PV-Msg02", &[], &mut scratch, &tag),
            Err(Error::InvalidData)
        );

        let mut bad_tag = tag;
        bad_tag[15] ^= 1;
        let mut scratch = buf;
        assert_eq!(
            decrypt(&KEY, b"PV-Msg02", &[], &mut scratch, &bad_tag),
            Err(Error::InvalidData)
        );

        let mut scratch = buf;
        assert_eq!(
            decrypt(&KEY, b"PV-Msg02", b"x", &mut scratch, &tag),
            Err(Error::InvalidData)
        );
    }

    #[test]
    fn short_nonces_pad_high_order() {
        let mut a = *b"payload";
        let tag_a = encrypt(&KEY, &[9], &[], &mut a);

        let mut b = *b"payload";
        let tag_b = encrypt(&KEY, &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 9], &[], &mut b);

        assert_eq!(a, b);
        assert_eq!(tag_a, tag_b);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut expected = [0u8; 100];
        for (i, b) in expected.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut one_shot = expected;
        let tag = encrypt(&KEY, &[7, 7], b"additional data", &mut one_shot);

        let mut streamed = expected;
        let mut ctx = AeadContext::new(&KEY, &[7, 7]);
        ctx.update_aad(b"additional");
        ctx.update_aad(b" data");
        let (head, tail) = streamed.split_at_mut(13);
        ctx.update_encrypt(head);
        ctx.update_encrypt(tail);
        let streamed_tag = ctx.finalize_encrypt();

        assert_eq!(streamed, one_shot);
        assert_eq!(streamed_tag, tag);

        let mut ctx = AeadContext::new(&KEY, &[7, 7]);
        ctx.update_aad(b"additional data");
        let (head, tail) = streamed.split_at_mut(64);
        ctx.update_decrypt(head);
        ctx.update_decrypt(tail);
        ctx.finalize_decrypt(&tag).unwrap();
        assert_eq!(streamed, expected);
    }
}
