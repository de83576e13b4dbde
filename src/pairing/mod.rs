//! Pairing data model and the Pair Setup / Pair Verify / Pairings procedures.
//!
//! A pairing is the persistent record of one controller: its identifier (iOS controllers use a
//! 36-character upper-case UUID string), its long-term Ed25519 public key, and a permission
//! byte whose bit 0 marks admins. Pairings live in the key-value store's `PAIRINGS` domain,
//! indexed by small integer keys.
//!
//! The invariant maintained across every mutation: if any pairing exists, at least one admin
//! pairing exists. When the last admin disappears, the whole set is purged together with the
//! BLE broadcast parameters and the Pair Resume cache.

pub mod pairings;
pub mod resume;
pub mod setup;
mod store;
pub mod verify;

pub use self::store::{
    add_pairing, enumerate_pairings, find_pairing, has_admin_pairing, has_pairings,
    purge_pairings, read_pairing, remove_pairing, update_pairing,
};

use crate::Error;

/// Maximum length of a pairing identifier in bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 36;

/// Length of a pairing's Ed25519 long-term public key in bytes.
pub const PUBLIC_KEY_BYTES: usize = 32;

/// Admin bit in a pairing's permission byte.
pub const PERMISSION_ADMIN: u8 = 0x01;

/// One paired controller.
#[derive(Clone, PartialEq, Eq)]
pub struct Pairing {
    /// Controller pairing identifier, `identifier_len` bytes used.
    pub identifier: [u8; MAX_IDENTIFIER_BYTES],
    /// Length of the identifier in bytes.
    pub identifier_len: u8,
    /// Long-term Ed25519 public key of the controller.
    pub public_key: [u8; PUBLIC_KEY_BYTES],
    /// Permission flags. Bit 0 marks an admin controller.
    pub permissions: u8,
}

impl Pairing {
    /// Creates a pairing record from its parts.
    ///
    /// Fails with `Error::InvalidData` when the identifier is empty or too long.
    pub fn new(identifier: &[u8], public_key: [u8; PUBLIC_KEY_BYTES], permissions: u8) -> Result<Self, Error> {
        if identifier.is_empty() || identifier.len() > MAX_IDENTIFIER_BYTES {
            return Err(Error::InvalidData);
        }
        let mut id = [0; MAX_IDENTIFIER_BYTES];
        id[..identifier.len()].copy_from_slice(identifier);
        Ok(Pairing {
            identifier: id,
            identifier_len: identifier.len() as u8,
            public_key,
            permissions,
        })
    }

    /// Returns the used portion of the identifier.
    pub fn identifier(&self) -> &[u8] {
        &self.identifier[..self.identifier_len as usize]
    }

    /// Returns whether this controller has admin permissions.
    pub fn is_admin(&self) -> bool {
        self.permissions & PERMISSION_ADMIN != 0
    }
}

enum_with_unknown! {
    /// Pairing methods.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Method(u8) {
        /// Pair Setup.
        PairSetup = 0x00,
        /// Pair Setup with hardware or software authentication.
        PairSetupWithAuth = 0x01,
        /// Pair Verify.
        PairVerify = 0x02,
        /// Add Pairing.
        AddPairing = 0x03,
        /// Remove Pairing.
        RemovePairing = 0x04,
        /// List Pairings.
        ListPairings = 0x05,
        /// Pair Resume (BLE only).
        PairResume = 0x06,
    }
}

/// Error codes of the pairing protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum PairingError {
    /// Generic error to handle unexpected situations.
    Unknown = 0x01,
    /// Setup code or signature verification failed.
    Authentication = 0x02,
    /// Server cannot accept any more pairings.
    MaxPeers = 0x04,
    /// Server reached its maximum number of authentication attempts.
    MaxTries = 0x05,
    /// Server pairing method is unavailable.
    Unavailable = 0x06,
    /// Server is busy and cannot accept a pairing request at this time.
    Busy = 0x07,
}

/// TLV types of the pairing protocol.
pub mod tlv_types {
    /// Method to use for pairing. Integer.
    pub const METHOD: u8 = 0x00;
    /// Identifier for authentication. UTF-8.
    pub const IDENTIFIER: u8 = 0x01;
    /// 16+ bytes of random salt.
    pub const SALT: u8 = 0x02;
    /// Curve25519, SRP public key, or signed Ed25519 key.
    pub const PUBLIC_KEY: u8 = 0x03;
    /// Ed25519 or SRP proof.
    pub const PROOF: u8 = 0x04;
    /// Encrypted data with auth tag at end.
    pub const ENCRYPTED_DATA: u8 = 0x05;
    /// State of the pairing process. 1 = M1, 2 = M2, etc. Integer.
    pub const STATE: u8 = 0x06;
    /// Error code. Only present when non-zero. Integer.
    pub const ERROR: u8 = 0x07;
    /// X.509 certificate.
    pub const CERTIFICATE: u8 = 0x09;
    /// Ed25519 or Apple Authentication Coprocessor signature.
    pub const SIGNATURE: u8 = 0x0A;
    /// Permissions of the controller being added. Integer.
    pub const PERMISSIONS: u8 = 0x0B;
    /// Identifier to resume a session.
    pub const SESSION_ID: u8 = 0x0E;
    /// Pairing type flags (32-bit unsigned integer).
    pub const FLAGS: u8 = 0x13;
}

/// Pairing type flags carried in Pair Setup M1/M2.
pub mod flags {
    /// Transient Pair Setup: M1..M4 without exchanging long-term public keys.
    pub const TRANSIENT: u32 = 1 << 4;
    /// Split Pair Setup: with `TRANSIENT`, save the SRP verifier used in this session; alone,
    /// reuse the saved verifier from a previous transient session.
    pub const SPLIT: u32 = 1 << 24;
}

/// The kind of pairing procedure in flight, for BLE procedure-timer bookkeeping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcedureType {
    /// Pair Setup (M1..M6).
    PairSetup,
    /// Pair Verify or Pair Resume.
    PairVerify,
    /// Add / Remove / List Pairings.
    Pairings,
}
