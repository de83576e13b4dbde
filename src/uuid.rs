//! HAP UUIDs (Apple-defined short form or full 128 bits).
//!
//! Apple-defined HomeKit types share the HAP Base UUID, `00000000-0000-1000-8000-0026BB765291`,
//! and are usually written in a short form consisting only of the leading 32 bits: `0x4C`
//! becomes `0000004C-0000-1000-8000-0026BB765291`. Vendor-specific types use full custom UUIDs.
//!
//! On the wire (GATT tables and HAP-Param-Characteristic-Type/Service-Type parameters), UUIDs are
//! serialized as 16 bytes in reversed (little-endian) order.

use crate::{bytes::*, Error};
use core::fmt;

/// The HAP Base UUID, encoded big-endian.
const BASE_UUID: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, /*-*/ 0x00, 0x00, /*-*/ 0x10, 0x00, /*-*/ 0x80, 0x00,
    /*-*/ 0x00, 0x26, 0xBB, 0x76, 0x52, 0x91,
];

/// A full 128-bit HAP UUID.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct HapUuid([u8; 16]);

impl HapUuid {
    /// Creates a UUID from 16 raw bytes (encoded in big-endian).
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates an Apple-defined UUID from its short form.
    ///
    /// The short value replaces the first four bytes of the HAP Base UUID: `short(0x4C)` is
    /// `0000004C-0000-1000-8000-0026BB765291`.
    pub const fn short(value: u32) -> Self {
        let v = value.to_be_bytes();
        let mut bytes = BASE_UUID;
        bytes[0] = v[0];
        bytes[1] = v[1];
        bytes[2] = v[2];
        bytes[3] = v[3];
        Self(bytes)
    }

    /// Parses a UUID string literal, panicking when the string is malformed.
    ///
    /// This is meant to be used in constant contexts.
    pub const fn parse_static(s: &'static str) -> Self {
        const fn parse_nibble(nibble: u8) -> u8 {
            match nibble {
                b'0'..=b'9' => nibble - b'0',
                b'a'..=b'f' => nibble - b'a' + 10,
                b'A'..=b'F' => nibble - b'A' + 10,
                _ => panic!("hex digit out of range"),
            }
        }

        // full UUID: 0000004c-0000-1000-8000-0026bb765291 (36 chars/bytes)
        // dashes at offsets 8, 13, 18, 23
        let mut index = 0;
        let mut bytes = [0; 16];

        macro_rules! eat_byte {
            ($s:ident[$i:ident..]) => {{
                let hi = parse_nibble($s.as_bytes()[$i]);
                $i += 1;
                let lo = parse_nibble($s.as_bytes()[$i]);
                $i += 1;
                (hi << 4) | lo
            }};
        }

        macro_rules! eat_dash {
            ($s:ident[$i:ident..]) => {{
                match $s.as_bytes()[$i] {
                    b'-' => {}
                    _ => panic!("expected dash"),
                }
                $i += 1;
            }};
        }

        bytes[0] = eat_byte!(s[index..]);
        bytes[1] = eat_byte!(s[index..]);
        bytes[2] = eat_byte!(s[index..]);
        bytes[3] = eat_byte!(s[index..]);
        eat_dash!(s[index..]);
        bytes[4] = eat_byte!(s[index..]);
        bytes[5] = eat_byte!(s[index..]);
        eat_dash!(s[index..]);
        bytes[6] = eat_byte!(s[index..]);
        bytes[7] = eat_byte!(s[index..]);
        eat_dash!(s[index..]);
        bytes[8] = eat_byte!(s[index..]);
        bytes[9] = eat_byte!(s[index..]);
        eat_dash!(s[index..]);
        bytes[10] = eat_byte!(s[index..]);
        bytes[11] = eat_byte!(s[index..]);
        bytes[12] = eat_byte!(s[index..]);
        bytes[13] = eat_byte!(s[index..]);
        bytes[14] = eat_byte!(s[index..]);
        bytes[15] = eat_byte!(s[index..]);

        // String must end here.
        if s.len() > index {
            panic!("unexpected trailing data");
        }

        HapUuid(bytes)
    }

    /// Returns the raw big-endian bytes of the UUID.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the UUID bytes in reversed order, as serialized on the wire.
    pub fn to_wire_bytes(&self) -> [u8; 16] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

/// UUIDs are serialized in reversed (little-endian) byte order.
impl ToBytes for HapUuid {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.to_wire_bytes())
    }
}

impl FromBytes<'_> for HapUuid {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let mut array: [u8; 16] = bytes.read_array()?;
        array.reverse();
        Ok(HapUuid(array))
    }
}

impl fmt::Debug for HapUuid {
    #[allow(clippy::many_single_char_names, clippy::just_underscores_and_digits)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [_0, _1, _2, _3, _4, _5, _6, _7, _8, _9, _10, _11, _12, _13, _14, _15] = self.0;
        let a = u32::from_be_bytes([_0, _1, _2, _3]);
        let b = u16::from_be_bytes([_4, _5]);
        let c = u16::from_be_bytes([_6, _7]);
        let d = u16::from_be_bytes([_8, _9]);
        let e = u64::from_be_bytes([0, 0, _10, _11, _12, _13, _14, _15]);
        write!(f, "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}", a, b, c, d, e)
    }
}

/// Apple-defined types the stack itself has to recognize.
///
/// The full HomeKit service and characteristic catalog lives with the application; only the types
/// that take part in the pairing and protocol plumbing are named here.
pub mod types {
    use super::HapUuid;

    /// Pairing service (BLE only).
    pub const SERVICE_PAIRING: HapUuid = HapUuid::short(0x55);
    /// Protocol Information service.
    pub const SERVICE_PROTOCOL_INFORMATION: HapUuid = HapUuid::short(0xA2);

    /// Pair Setup characteristic.
    pub const CHARACTERISTIC_PAIR_SETUP: HapUuid = HapUuid::short(0x4C);
    /// Pair Verify characteristic.
    pub const CHARACTERISTIC_PAIR_VERIFY: HapUuid = HapUuid::short(0x4E);
    /// Pairing Features characteristic.
    pub const CHARACTERISTIC_PAIRING_FEATURES: HapUuid = HapUuid::short(0x4F);
    /// Pairing Pairings characteristic.
    pub const CHARACTERISTIC_PAIRING_PAIRINGS: HapUuid = HapUuid::short(0x50);
    /// Service Signature characteristic.
    pub const CHARACTERISTIC_SERVICE_SIGNATURE: HapUuid = HapUuid::short(0xA5);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::format;

    #[test]
    fn fmt() {
        let uuid = HapUuid::short(0x4C);
        assert_eq!(
            format!("{:?}", uuid),
            "0000004c-0000-1000-8000-0026bb765291"
        );
    }

    #[test]
    fn parse() {
        let uuid = "0000004c-0000-1000-8000-0026bb765291";
        assert_eq!(HapUuid::parse_static(uuid), HapUuid::short(0x4C));
        assert_eq!(format!("{:?}", HapUuid::parse_static(uuid)), uuid);
    }

    #[test]
    fn wire_order_is_reversed() {
        let uuid = HapUuid::short(0x4C);
        let wire = uuid.to_wire_bytes();
        assert_eq!(wire[12], 0x4C);
        assert_eq!(wire[15], 0x00);

        let mut reader = ByteReader::new(&wire);
        assert_eq!(<HapUuid as FromBytes>::from_bytes(&mut reader).unwrap(), uuid);
    }
}
