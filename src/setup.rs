//! Setup code, setup payload and setup hash derivation.
//!
//! The setup code is the 8-digit secret the user enters during Pair Setup, formatted
//! `XXX-XX-XXX`. The setup payload is the `X-HM://` URL printed on labels and encoded in QR and
//! NFC tags; it packs the accessory category, supported transports, the paired flag and the
//! setup code into 45 bits of base-36, followed by the 4-character setup ID. The setup hash
//! links advertisements to a specific payload without revealing the code.
//!
//! The base-36 encoder operates on the secret setup code, so both the division by 36 and the
//! digit-to-ASCII mapping are branch-free.

use crate::crypto::hash;
use crate::Error;
use rand_core::{CryptoRng, RngCore};

/// An accessory setup code in `XXX-XX-XXX` format.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SetupCode(pub [u8; 10]);

/// A 4-character setup ID (`0-9A-Z`).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SetupId(pub [u8; 4]);

/// The accessory's device ID in `XX:XX:XX:XX:XX:XX` string form.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceIdString([u8; 17]);

/// A setup payload string: `X-HM://` + 9 base-36 characters + setup ID.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SetupPayload(pub [u8; 20]);

/// The 4-byte setup hash advertised over mDNS TXT records and BLE manufacturer data.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SetupHash(pub [u8; 4]);

/// Transport and pairing state flags encoded in a setup payload.
#[derive(Copy, Clone, Default)]
pub struct SetupPayloadFlags {
    /// Accessory supports HAP over BLE.
    pub ble_supported: bool,
    /// Accessory supports HAP over IP.
    pub ip_supported: bool,
    /// Accessory is already paired.
    pub is_paired: bool,
}

impl SetupCode {
    /// Returns the code as a string slice.
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).expect("setup codes are ASCII")
    }
}

impl SetupId {
    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).expect("setup IDs are ASCII")
    }
}

impl DeviceIdString {
    /// Formats a 6-byte device ID as its colon-separated string form.
    pub fn from_bytes(device_id: &[u8; 6]) -> Self {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let mut string = [0; 17];
        for (i, byte) in device_id.iter().enumerate() {
            string[i * 3] = HEX[(byte >> 4) as usize];
            string[i * 3 + 1] = HEX[(byte & 0x0f) as usize];
            if i != 5 {
                string[i * 3 + 2] = b':';
            }
        }
        DeviceIdString(string)
    }

    /// Returns the raw 17 ASCII bytes.
    pub fn as_bytes(&self) -> &[u8; 17] {
        &self.0
    }

    /// Returns the device ID as a string slice.
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).expect("device IDs are ASCII")
    }
}

/// Validates an accessory setup code.
///
/// Valid codes are ten bytes of the form `XXX-XX-XXX` with decimal digits. Codes whose digits
/// are all equal, fully ascending from 1 (`123-45-678`) or fully descending from 8
/// (`876-54-321`) are trivial to guess and rejected.
pub fn is_valid_setup_code(code: &[u8]) -> bool {
    if code.len() != 10 {
        return false;
    }

    let mut num_equal = 0u8;
    let mut num_ascending = 0u8;
    let mut num_descending = 0u8;

    let mut previous = 0u8;
    for (i, &c) in code.iter().enumerate() {
        if i == 3 || i == 6 {
            if c != b'-' {
                return false;
            }
        } else {
            if !c.is_ascii_digit() {
                return false;
            }
            num_equal += (c == previous) as u8;
            num_ascending += (c == previous.wrapping_add(1)) as u8;
            num_descending += (c == previous.wrapping_sub(1)) as u8;
            previous = c;
        }
    }

    // All equal, ascending, or descending?
    num_equal != 7
        && ((code[0] ^ b'1') | (num_ascending ^ 7)) != 0
        && ((code[0] ^ b'8') | (num_descending ^ 7)) != 0
}

/// Generates a random setup code, retrying until the validator accepts it.
pub fn generate_setup_code<R: RngCore + CryptoRng>(rng: &mut R) -> SetupCode {
    loop {
        let mut code = [0; 10];
        for (i, c) in code.iter_mut().enumerate() {
            if i == 3 || i == 6 {
                *c = b'-';
                continue;
            }
            // Rejection-sample a decimal digit.
            let mut byte = [0; 1];
            loop {
                rng.fill_bytes(&mut byte);
                if byte[0] & 0x0f <= 9 {
                    break;
                }
            }
            *c = b'0' + (byte[0] & 0x0f);
        }
        if is_valid_setup_code(&code) {
            return SetupCode(code);
        }
    }
}

/// Validates a 4-character setup ID (`0-9A-Z`).
pub fn is_valid_setup_id(id: &[u8]) -> bool {
    id.len() == 4
        && id
            .iter()
            .all(|c| c.is_ascii_digit() || (b'A'..=b'Z').contains(c))
}

/// Generates a random setup ID.
pub fn generate_setup_id<R: RngCore + CryptoRng>(rng: &mut R) -> SetupId {
    let mut id = [0; 4];
    for c in id.iter_mut() {
        let mut byte = [0; 1];
        loop {
            rng.fill_bytes(&mut byte);
            if byte[0].is_ascii_digit() || (b'A'..=b'Z').contains(&byte[0]) {
                break;
            }
        }
        *c = byte[0];
    }
    SetupId(id)
}

/// Derives the setup payload for a setup code, setup ID, category, and transport flags.
///
/// A paired accessory publishes a payload without code and setup ID (all-zero digits).
pub fn setup_payload(
    setup_code: Option<&SetupCode>,
    setup_id: Option<&SetupId>,
    flags: SetupPayloadFlags,
    category: u8,
) -> Result<SetupPayload, Error> {
    if setup_code.is_some() != setup_id.is_some() {
        return Err(Error::InvalidState);
    }
    if setup_code.is_some() && flags.is_paired {
        return Err(Error::InvalidState);
    }
    if !flags.ip_supported && !flags.ble_supported {
        return Err(Error::InvalidState);
    }
    if category == 0 {
        return Err(Error::InvalidState);
    }

    let mut payload = [0; 20];
    payload[..7].copy_from_slice(b"X-HM://");

    // 45-bit field: version (45-43) and reserved (42-39) zero, category (38-31),
    // BLE (29), IP (28), paired (27), decimal setup code (26-0).
    let mut code: u64 = ((category as u64) << 31)
        | ((flags.ble_supported as u64) << 29)
        | ((flags.ip_supported as u64) << 28)
        | ((flags.is_paired as u64) << 27);

    if let Some(setup_code) = setup_code {
        let digit = |i: usize| (setup_code.0[i] - b'0') as u64;
        code |= digit(0) * 10_000_000
            + digit(1) * 1_000_000
            + digit(2) * 100_000
            + digit(4) * 10_000
            + digit(5) * 1_000
            + digit(7) * 100
            + digit(8) * 10
            + digit(9);
    }

    // Base-36 encode, least significant digit first, written big-endian. The reciprocal
    // division and the digit-to-ASCII mapping avoid data-dependent branches because `code`
    // contains the secret setup code.
    for i in 0..9 {
        let x = code;
        let mut q = x - (x >> 3);
        q += q >> 6;
        q += q >> 12;
        q += q >> 24;
        q += q >> 48;
        q >>= 5;
        let r = (x as u32).wrapping_sub((q as u32).wrapping_mul(36));
        let d = (r + 28) >> 6;
        code = q + d as u64;
        let c = (r - d * 36) as u8;

        //    Index: 0          10
        // Alphabet: 0123456789 ABCDEFGHIJKLMNOPQRSTUVWXYZ
        //    ASCII: 48      57 65                      90
        let c = (c as i8 + b'0' as i8
            + ((((c as i16 + 0x80 - 10) as i8) >> 7) & (b'A' as i8 - b'9' as i8 - 1)))
            as u8;

        payload[7 + 8 - i] = c;
    }

    match setup_id {
        Some(setup_id) => payload[16..].copy_from_slice(&setup_id.0),
        None => payload[16..].copy_from_slice(b"0000"),
    }

    Ok(SetupPayload(payload))
}

/// Derives the setup hash: the first four bytes of `SHA512(setup ID || device ID)`.
pub fn setup_hash(setup_id: &SetupId, device_id: &DeviceIdString) -> SetupHash {
    let digest = hash::sha512_concat(&[&setup_id.0, device_id.as_bytes()]);
    let mut hash = [0; 4];
    hash.copy_from_slice(&digest[..4]);
    SetupHash(hash)
}

impl core::fmt::Debug for SetupPayload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(core::str::from_utf8(&self.0).unwrap_or("<invalid>"))
    }
}

impl core::fmt::Debug for SetupCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Setup codes are secrets; don't put them in logs.
        f.write_str("SetupCode(***-**-***)")
    }
}
