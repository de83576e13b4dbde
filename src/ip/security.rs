//! The IP framed security protocol.
//!
//! Once Pair Verify completes, every HTTP request and response is reframed as a sequence of
//! authenticated frames:
//!
//! ```text
//! <frame_len: u16 LE> <ciphertext: frame_len bytes> <tag: 16 bytes>
//! ```
//!
//! The two length bytes double as the AAD of the frame. Frames carry at most 1024 plaintext
//! bytes; longer data is segmented and only the final frame is short. Each direction uses its
//! session counter as the nonce, so frames must be decrypted in arrival order.

use crate::crypto::aead;
use crate::session::Session;
use crate::Error;

/// Maximum number of plaintext bytes per frame.
pub const MAX_FRAME_BYTES: usize = 1024;

/// Length of the AAD (the frame length prefix) in bytes.
pub const NUM_AAD_BYTES: usize = 2;

/// Returns the encrypted size of `num_plaintext_bytes` of data after framing.
pub fn encrypted_size(num_plaintext_bytes: usize) -> usize {
    let full_frames = num_plaintext_bytes / MAX_FRAME_BYTES;
    let mut size = full_frames * (NUM_AAD_BYTES + MAX_FRAME_BYTES + aead::TAG_BYTES);
    let remainder = num_plaintext_bytes % MAX_FRAME_BYTES;
    if remainder != 0 {
        size += NUM_AAD_BYTES + remainder + aead::TAG_BYTES;
    }
    size
}

/// Encrypts `plaintext` into framed form in `out`, returning the number of bytes written.
///
/// `out` must provide at least [`encrypted_size`] bytes.
///
/// [`encrypted_size`]: fn.encrypted_size.html
pub fn encrypt_data(
    session: &mut Session,
    plaintext: &[u8],
    out: &mut [u8],
) -> Result<usize, Error> {
    if out.len() < encrypted_size(plaintext.len()) {
        return Err(Error::OutOfResources);
    }

    let mut written = 0;
    for chunk in plaintext.chunks(MAX_FRAME_BYTES) {
        let frame_len = chunk.len();
        out[written..written + NUM_AAD_BYTES]
            .copy_from_slice(&(frame_len as u16).to_le_bytes());
        out[written + NUM_AAD_BYTES..written + NUM_AAD_BYTES + frame_len].copy_from_slice(chunk);

        let (aad, rest) = out[written..].split_at_mut(NUM_AAD_BYTES);
        let tag = session.encrypt_with_aad(aad, &mut rest[..frame_len])?;
        rest[frame_len..frame_len + aead::TAG_BYTES].copy_from_slice(&tag);

        written += NUM_AAD_BYTES + frame_len + aead::TAG_BYTES;
    }
    Ok(written)
}

/// Result of a [`decrypt_data`] pass over a receive buffer.
///
/// [`decrypt_data`]: fn.decrypt_data.html
#[derive(Debug, PartialEq, Eq)]
pub struct DecryptedData {
    /// Length of the contiguous plaintext now at the start of the buffer.
    pub plaintext_len: usize,
    /// Number of input bytes consumed. Bytes past this offset are an incomplete trailing frame
    /// and must be retained for the next pass.
    pub consumed: usize,
}

/// Decrypts all complete frames in `buf` in place.
///
/// The plaintext of consecutive frames is compacted to the front of the buffer. An oversized
/// frame length or an authentication failure yields `Error::InvalidData`; the session must then
/// be invalidated and the socket closed.
pub fn decrypt_data(session: &mut Session, buf: &mut [u8]) -> Result<DecryptedData, Error> {
    let mut read = 0;
    let mut write = 0;

    loop {
        if buf.len() - read < NUM_AAD_BYTES {
            break;
        }
        let frame_len =
            u16::from_le_bytes([buf[read], buf[read + 1]]) as usize;
        if frame_len > MAX_FRAME_BYTES {
            info!("oversized security frame ({} bytes)", frame_len);
            return Err(Error::InvalidData);
        }
        if buf.len() - read < NUM_AAD_BYTES + frame_len + aead::TAG_BYTES {
            break;
        }

        let aad = [buf[read], buf[read + 1]];
        let mut tag = [0; aead::TAG_BYTES];
        tag.copy_from_slice(
            &buf[read + NUM_AAD_BYTES + frame_len
                ..read + NUM_AAD_BYTES + frame_len + aead::TAG_BYTES],
        );

        let ciphertext = &mut buf[read + NUM_AAD_BYTES..read + NUM_AAD_BYTES + frame_len];
        session.decrypt_with_aad(&aad, ciphertext, &tag)?;

        buf.copy_within(read + NUM_AAD_BYTES..read + NUM_AAD_BYTES + frame_len, write);
        write += frame_len;
        read += NUM_AAD_BYTES + frame_len + aead::TAG_BYTES;
    }

    Ok(DecryptedData {
        plaintext_len: write,
        consumed: read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SecurityContext, SessionId, TransportType};

    fn secured_pair() -> (Session, Session) {
        let mut accessory = Session::new(SessionId(1), TransportType::Ip);
        accessory.security = Some(SecurityContext::new([0x0a; 32], [0x0c; 32]));
        let mut controller = Session::new(SessionId(2), TransportType::Ip);
        controller.security = Some(SecurityContext::new([0x0c; 32], [0x0a; 32]));
        (accessory, controller)
    }

    #[test]
    fn frame_layout() {
        let (mut accessory, mut controller) = secured_pair();
        let plaintext = b"HTTP/1.1 200 OK\r\n\r\n";

        let mut out = [0u8; 64];
        let written = encrypt_data(&mut accessory, plaintext, &mut out).unwrap();
        assert_eq!(written, 2 + 19 + 16);
        assert_eq!(&out[..2], &[0x13, 0x00]);
        assert_ne!(&out[2..21], plaintext);

        let result = decrypt_data(&mut controller, &mut out[..written]).unwrap();
        assert_eq!(result.plaintext_len, 19);
        assert_eq!(result.consumed, written);
        assert_eq!(&out[..19], plaintext);
    }

    #[test]
    fn segments_at_1024() {
        let (mut accessory, mut controller) = secured_pair();
        let plaintext: std::vec::Vec<u8> = (0..1500u32).map(|i| i as u8).collect();

        assert_eq!(encrypted_size(1500), (2 + 1024 + 16) + (2 + 476 + 16));
        let mut out = std::vec![0u8; encrypted_size(1500)];
        let written = encrypt_data(&mut accessory, &plaintext, &mut out).unwrap();
        assert_eq!(written, out.len());

        let result = decrypt_data(&mut controller, &mut out).unwrap();
        assert_eq!(result.plaintext_len, 1500);
        assert_eq!(&out[..1500], &plaintext[..]);
    }

    #[test]
    fn partial_trailing_frame_is_retained() {
        let (mut accessory, mut controller) = secured_pair();

        let mut first = [0u8; 64];
        let first_len = encrypt_data(&mut accessory, b"frame one", &mut first).unwrap();
        let mut second = [0u8; 64];
        let second_len = encrypt_data(&mut accessory, b"frame two", &mut second).unwrap();

        // Receive the first frame plus a truncated prefix of the second.
        let mut rx = std::vec::Vec::new();
        rx.extend_from_slice(&first[..first_len]);
        rx.extend_from_slice(&second[..second_len - 5]);

        let result = decrypt_data(&mut controller, &mut rx).unwrap();
        assert_eq!(result.plaintext_len, 9);
        assert_eq!(result.consumed, first_len);
        assert_eq!(&rx[..9], b"frame one");

        // Completing the trailing frame decrypts it.
        let mut rest = std::vec::Vec::new();
        rest.extend_from_slice(&rx[result.consumed..]);
        rest.extend_from_slice(&second[second_len - 5..]);
        let result = decrypt_data(&mut controller, &mut rest).unwrap();
        assert_eq!(result.plaintext_len, 9);
        assert_eq!(&rest[..9], b"frame two");
    }

    #[test]
    fn corrupted_frame_fails() {
        let (mut accessory, mut controller) = secured_pair();
        let mut out = [0u8; 64];
        let written = encrypt_data(&mut accessory, b"payload", &mut out).unwrap();

        let mut tampered: std::vec::Vec<u8> = out[..written].to_vec();
        tampered[3] ^= 0x01;
        assert_eq!(
            decrypt_data(&mut controller, &mut tampered),
            Err(Error::InvalidData)
        );

        // Oversized frame length is rejected outright.
        let mut oversized = [0u8; 4];
        oversized[..2].copy_from_slice(&2000u16.to_le_bytes());
        assert_eq!(
            decrypt_data(&mut controller, &mut oversized),
            Err(Error::InvalidData)
        );
    }
}
