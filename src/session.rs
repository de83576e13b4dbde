//! Per-connection session state and the transport security channel.
//!
//! A session is bound to one transport connection. Before Pair Verify completes it only carries
//! the pairing procedure sub-states; afterwards it owns the security context, a pair of
//! ChaCha20-Poly1305 keys with monotonically increasing message counters, one per direction.
//! The 12-byte nonce of each message is the 64-bit counter in little-endian with a 4-byte zero
//! prefix.

use crate::ble::session::BleSession;
use crate::crypto::aead;
use crate::pairing::{pairings, setup, verify};
use crate::platform::Key;
use crate::Error;

/// The transport a session runs on, fixed at creation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportType {
    /// HAP over IP (Ethernet / Wi-Fi).
    Ip,
    /// HAP over Bluetooth Low Energy.
    Ble,
}

/// Identifies a session towards the accessory server.
///
/// Sessions are owned by the transport glue; the server tracks exclusive resources (the single
/// outstanding Pair Setup) by session ID.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionId(pub(crate) u32);

/// Established transport encryption keys and message counters.
pub struct SecurityContext {
    pub(crate) accessory_to_controller_key: [u8; aead::KEY_BYTES],
    pub(crate) controller_to_accessory_key: [u8; aead::KEY_BYTES],
    accessory_to_controller_count: u64,
    controller_to_accessory_count: u64,
}

impl SecurityContext {
    pub(crate) fn new(
        accessory_to_controller_key: [u8; aead::KEY_BYTES],
        controller_to_accessory_key: [u8; aead::KEY_BYTES],
    ) -> Self {
        SecurityContext {
            accessory_to_controller_key,
            controller_to_accessory_key,
            accessory_to_controller_count: 0,
            controller_to_accessory_count: 0,
        }
    }
}

/// State of one transport session.
pub struct Session {
    pub(crate) id: SessionId,
    transport: TransportType,
    pub(crate) setup: setup::SetupSubState,
    pub(crate) verify: verify::VerifySubState,
    pub(crate) pairings: pairings::PairingsSubState,
    pub(crate) security: Option<SecurityContext>,
    pub(crate) transient: bool,
    pub(crate) pairing_key: Option<Key>,
    pub(crate) is_admin: bool,
    pub(crate) ble: BleSession,
}

impl Session {
    pub(crate) fn new(id: SessionId, transport: TransportType) -> Self {
        Session {
            id,
            transport,
            setup: setup::SetupSubState::default(),
            verify: verify::VerifySubState::default(),
            pairings: pairings::PairingsSubState::default(),
            security: None,
            transient: false,
            pairing_key: None,
            is_admin: false,
            ble: BleSession::default(),
        }
    }

    /// Returns the session's identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the transport this session is bound to.
    pub fn transport_type(&self) -> TransportType {
        self.transport
    }

    /// Returns whether a security session has been established.
    pub fn is_secured(&self) -> bool {
        self.security.is_some()
    }

    /// Returns whether this is a transient session (split Pair Setup without key exchange).
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Returns whether the controller on this session verified as an admin.
    pub fn controller_is_admin(&self) -> bool {
        self.is_secured() && self.is_admin
    }

    /// Drops the security context and all pairing procedure progress.
    ///
    /// On BLE the session additionally becomes terminal; the server tears the link down once it
    /// is safe to disconnect.
    pub(crate) fn clear_security(&mut self) {
        self.security = None;
        self.transient = false;
        self.pairing_key = None;
        self.is_admin = false;
        self.setup = setup::SetupSubState::default();
        self.verify = verify::VerifySubState::default();
        self.pairings = pairings::PairingsSubState::default();
    }

    /// Encrypts an outgoing control message in place, returning the authentication tag.
    pub fn encrypt_with_aad(
        &mut self,
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<[u8; aead::TAG_BYTES], Error> {
        let security = self.security.as_mut().ok_or(Error::InvalidState)?;
        let nonce = security.accessory_to_controller_count.to_le_bytes();
        let tag = aead::encrypt(&security.accessory_to_controller_key, &nonce, aad, buf);
        security.accessory_to_controller_count += 1;
        Ok(tag)
    }

    /// Decrypts an incoming control message in place, verifying the authentication tag.
    ///
    /// The counter is only advanced on success; a failed decryption leaves the session state to
    /// be invalidated by the caller.
    pub fn decrypt_with_aad(
        &mut self,
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8; aead::TAG_BYTES],
    ) -> Result<(), Error> {
        let security = self.security.as_mut().ok_or(Error::InvalidState)?;
        let nonce = security.controller_to_accessory_count.to_le_bytes();
        aead::decrypt(&security.controller_to_accessory_key, &nonce, aad, buf, tag)?;
        security.controller_to_accessory_count += 1;
        Ok(())
    }

    /// Encrypts `buf[..len]` in place and appends the tag, returning the total length.
    ///
    /// `buf` must have at least 16 bytes of headroom after `len`.
    pub fn encrypt_trailing_tag(&mut self, buf: &mut [u8], len: usize) -> Result<usize, Error> {
        if buf.len() < len + aead::TAG_BYTES {
            return Err(Error::OutOfResources);
        }
        let tag = self.encrypt_with_aad(&[], &mut buf[..len])?;
        buf[len..len + aead::TAG_BYTES].copy_from_slice(&tag);
        Ok(len + aead::TAG_BYTES)
    }

    /// Decrypts a message whose tag trails the ciphertext, returning the plaintext length.
    pub fn decrypt_trailing_tag(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.len() < aead::TAG_BYTES {
            return Err(Error::InvalidData);
        }
        let len = buf.len() - aead::TAG_BYTES;
        let (data, tag) = buf.split_at_mut(len);
        let mut tag_bytes = [0; aead::TAG_BYTES];
        tag_bytes.copy_from_slice(tag);
        self.decrypt_with_aad(&[], data, &tag_bytes)?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secured_pair() -> (Session, Session) {
        // Two sessions with mirrored keys, standing in for accessory and controller.
        let mut accessory = Session::new(SessionId(1), TransportType::Ip);
        accessory.security = Some(SecurityContext::new([1; 32], [2; 32]));
        let mut controller = Session::new(SessionId(2), TransportType::Ip);
        controller.security = Some(SecurityContext::new([2; 32], [1; 32]));
        (accessory, controller)
    }

    #[test]
    fn counters_advance_per_direction() {
        let (mut accessory, mut controller) = secured_pair();

        for round in 0u8..3 {
            let mut buf = [round; 8];
            let tag = accessory.encrypt_with_aad(b"len", &mut buf).unwrap();
            controller.decrypt_with_aad(b"len", &mut buf, &tag).unwrap();
            assert_eq!(buf, [round; 8]);
        }
    }

    #[test]
    fn tampered_tag_is_rejected_and_counter_unchanged() {
        let (mut accessory, mut controller) = secured_pair();

        let mut buf = *b"message0";
        let tag = accessory.encrypt_with_aad(&[], &mut buf).unwrap();

        let mut bad_tag = tag;
        bad_tag[0] ^= 1;
        let mut scratch = buf;
        assert_eq!(
            controller.decrypt_with_aad(&[], &mut scratch, &bad_tag),
            Err(Error::InvalidData)
        );

        // The failed attempt must not have consumed a counter value.
        let mut scratch = buf;
        controller.decrypt_with_aad(&[], &mut scratch, &tag).unwrap();
        assert_eq!(&scratch, b"message0");
    }

    #[test]
    fn trailing_tag_round_trip() {
        let (mut accessory, mut controller) = secured_pair();

        let mut buf = [0u8; 32];
        buf[..5].copy_from_slice(b"hello");
        let total = accessory.encrypt_trailing_tag(&mut buf, 5).unwrap();
        assert_eq!(total, 21);

        let len = controller.decrypt_trailing_tag(&mut buf[..total]).unwrap();
        assert_eq!(&buf[..len], b"hello");
    }

    #[test]
    fn unsecured_session_cannot_encrypt() {
        let mut session = Session::new(SessionId(1), TransportType::Ble);
        let mut buf = [0u8; 4];
        assert_eq!(
            session.encrypt_with_aad(&[], &mut buf),
            Err(Error::InvalidState)
        );
    }
}
