//! The accessory / service / characteristic attribute model.
//!
//! An accessory server hosts one primary accessory and, for a bridge, a list of bridged
//! accessories. Each accessory owns an ordered list of services, each service an ordered list of
//! characteristics. Services and characteristics carry a 64-bit instance ID (IID) unique within
//! their accessory; BLE additionally requires IIDs to fit in 16 bits because the PDU header
//! addresses them as `u16`.
//!
//! The descriptor types in this module are immutable and borrowed: an application defines its
//! attribute database as `static` (or stack-held) structs and slices, and the stack stores
//! per-connection runtime state separately, keyed by IID. Characteristic values themselves live
//! with the application, which serves reads and writes through [`AccessoryDelegate`].
//!
//! [`AccessoryDelegate`]: trait.AccessoryDelegate.html

use crate::bytes::ByteWriter;
use crate::uuid::{types, HapUuid};
use crate::Error;

/// Serialization format of a characteristic value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    /// Opaque bytes.
    Data,
    /// Boolean encoded as one byte, 0 or 1.
    Bool,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// Signed 32-bit integer.
    Int,
    /// IEEE 754 32-bit float.
    Float,
    /// UTF-8 string without NUL bytes.
    String,
    /// A nested TLV8 structure.
    Tlv8,
}

impl Format {
    /// The Bluetooth SIG format code used in GATT presentation format descriptors.
    pub fn gatt_format_code(&self) -> u8 {
        match self {
            Format::Data => 0x1b,
            Format::Bool => 0x01,
            Format::UInt8 => 0x04,
            Format::UInt16 => 0x06,
            Format::UInt32 => 0x08,
            Format::UInt64 => 0x0a,
            Format::Int => 0x10,
            Format::Float => 0x14,
            Format::String => 0x19,
            Format::Tlv8 => 0x1b,
        }
    }
}

/// Unit of a numeric characteristic value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Unit {
    /// Unitless.
    None,
    /// Degrees Celsius.
    Celsius,
    /// Degrees of arc.
    ArcDegrees,
    /// Percentage.
    Percentage,
    /// Illuminance in lux.
    Lux,
    /// Time in seconds.
    Seconds,
}

/// Value constraints advertised in signature reads and enforced on writes by the application.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Constraints {
    /// No constraints (booleans, TLV8, data without length limit).
    None,
    /// Range and step for the unsigned integer formats.
    UInt {
        /// Minimum value.
        min: u64,
        /// Maximum value.
        max: u64,
        /// Step, 0 for none.
        step: u64,
    },
    /// Range and step for the `Int` format.
    Int {
        /// Minimum value.
        min: i32,
        /// Maximum value.
        max: i32,
        /// Step, 0 for none.
        step: u32,
    },
    /// Range and step for the `Float` format.
    Float {
        /// Minimum value.
        min: f32,
        /// Maximum value.
        max: f32,
        /// Step, 0.0 for none.
        step: f32,
    },
    /// Maximum length in bytes for `String` values.
    MaxLength(u16),
    /// Maximum length in bytes for `Data` values.
    MaxDataLength(u32),
}

bitflags::bitflags! {
    /// Properties of a characteristic.
    pub struct CharacteristicProperties: u16 {
        /// Value can be read.
        const READABLE = 1 << 0;
        /// Value can be written.
        const WRITABLE = 1 << 1;
        /// Value changes are delivered as event notifications.
        const SUPPORTS_EVENT_NOTIFICATION = 1 << 2;
        /// Reads are only answered for admin controllers.
        const READ_REQUIRES_ADMIN = 1 << 3;
        /// Writes are only accepted from admin controllers.
        const WRITE_REQUIRES_ADMIN = 1 << 4;
        /// Writes must use the Timed Write procedure.
        const REQUIRES_TIMED_WRITE = 1 << 5;
        /// Writes may carry additional authorization data.
        const SUPPORTS_AUTHORIZATION_DATA = 1 << 6;
        /// BLE: value may be read over an insecure session (pairing characteristics).
        const READABLE_WITHOUT_SECURITY = 1 << 7;
        /// BLE: value may be written over an insecure session (pairing characteristics).
        const WRITABLE_WITHOUT_SECURITY = 1 << 8;
        /// BLE: value supports broadcast notifications.
        const SUPPORTS_BROADCAST_NOTIFICATION = 1 << 9;
        /// BLE: value supports disconnected notifications.
        const SUPPORTS_DISCONNECTED_NOTIFICATION = 1 << 10;
    }
}

bitflags::bitflags! {
    /// Properties of a service, as serialized in HAP-Param-HAP-Service-Properties.
    pub struct ServiceProperties: u16 {
        /// This is the primary service of the accessory.
        const PRIMARY = 1 << 0;
        /// The service should not be surfaced to users.
        const HIDDEN = 1 << 1;
        /// The service supports configuration (Protocol Information).
        const SUPPORTS_CONFIGURATION = 1 << 2;
    }
}

/// A characteristic descriptor.
#[derive(Debug)]
pub struct Characteristic<'a> {
    /// Instance ID, unique within the accessory. Never 0.
    pub iid: u64,
    /// The characteristic type.
    pub uuid: HapUuid,
    /// Serialization format of the value.
    pub format: Format,
    /// Property flags.
    pub properties: CharacteristicProperties,
    /// Unit of numeric values.
    pub unit: Unit,
    /// Value constraints.
    pub constraints: Constraints,
    /// Optional user-visible description, surfaced as a GATT descriptor on BLE.
    pub user_description: Option<&'a str>,
}

impl<'a> Characteristic<'a> {
    /// Returns whether accessing this characteristic tears down the security session.
    ///
    /// Pair Setup, Pair Verify and Pairing Features restart the security handshake; the BLE
    /// engine aborts pending fallback procedures when they are written.
    pub fn drops_security_session(&self) -> bool {
        self.uuid == types::CHARACTERISTIC_PAIR_SETUP
            || self.uuid == types::CHARACTERISTIC_PAIR_VERIFY
            || self.uuid == types::CHARACTERISTIC_PAIRING_FEATURES
    }
}

/// A service descriptor.
#[derive(Debug)]
pub struct Service<'a> {
    /// Instance ID, unique within the accessory. Never 0.
    pub iid: u64,
    /// The service type.
    pub uuid: HapUuid,
    /// Property flags.
    pub properties: ServiceProperties,
    /// IIDs of linked services within the same accessory.
    pub linked_services: &'a [u64],
    /// The characteristics of this service.
    pub characteristics: &'a [Characteristic<'a>],
}

/// An accessory descriptor.
#[derive(Debug)]
pub struct Accessory<'a> {
    /// Accessory instance ID. The primary accessory has aid 1.
    pub aid: u64,
    /// Accessory category as advertised in the setup payload.
    pub category: u8,
    /// Display name.
    pub name: &'a str,
    /// Manufacturer name.
    pub manufacturer: &'a str,
    /// Model name.
    pub model: &'a str,
    /// Serial number.
    pub serial_number: &'a str,
    /// Firmware version in `major.minor.revision` form.
    pub firmware_version: &'a str,
    /// The services of this accessory.
    pub services: &'a [Service<'a>],
}

impl<'a> Accessory<'a> {
    /// Finds the service and characteristic with the given characteristic IID.
    pub fn characteristic_by_iid(&self, iid: u64) -> Option<(&Service<'a>, &Characteristic<'a>)> {
        for service in self.services {
            for characteristic in service.characteristics {
                if characteristic.iid == iid {
                    return Some((service, characteristic));
                }
            }
        }
        None
    }

    /// Finds the service with the given service IID.
    pub fn service_by_iid(&self, iid: u64) -> Option<&Service<'a>> {
        self.services.iter().find(|service| service.iid == iid)
    }
}

/// Validates an attribute tree before the server starts.
///
/// Checks IID uniqueness and non-zero IIDs per accessory, the primary accessory's aid, and
/// uniqueness of bridged accessory aids. With `ble` set, additionally requires all IIDs to fit
/// the 16-bit wire representation.
pub fn validate_tree(
    primary: &Accessory<'_>,
    bridged: &[&Accessory<'_>],
    ble: bool,
) -> Result<(), Error> {
    if primary.aid != 1 {
        info!("primary accessory must have aid 1");
        return Err(Error::InvalidData);
    }

    for (i, accessory) in core::iter::once(&primary).chain(bridged.iter()).enumerate() {
        if i > 0 && accessory.aid == 1 {
            info!("bridged accessory must not reuse aid 1");
            return Err(Error::InvalidData);
        }
        validate_accessory(*accessory, ble)?;
    }

    for (i, a) in bridged.iter().enumerate() {
        if bridged[..i].iter().any(|b| b.aid == a.aid) {
            info!("duplicate bridged accessory aid {}", a.aid);
            return Err(Error::InvalidData);
        }
    }

    Ok(())
}

fn validate_accessory(accessory: &Accessory<'_>, ble: bool) -> Result<(), Error> {
    let seen = |iid: u64, upto_service: usize, upto_char: Option<usize>| -> bool {
        for (si, service) in accessory.services.iter().enumerate() {
            if si > upto_service {
                break;
            }
            if service.iid == iid && (si < upto_service || upto_char.is_some()) {
                return true;
            }
            for (ci, characteristic) in service.characteristics.iter().enumerate() {
                let within = si < upto_service || upto_char.map_or(false, |c| ci < c);
                if within && characteristic.iid == iid {
                    return true;
                }
            }
        }
        false
    };

    for (si, service) in accessory.services.iter().enumerate() {
        if service.iid == 0 {
            info!("service IID must not be 0");
            return Err(Error::InvalidData);
        }
        if ble && service.iid > u16::MAX as u64 {
            info!("service IID {} does not fit the BLE wire format", service.iid);
            return Err(Error::InvalidData);
        }
        if seen(service.iid, si, None) {
            info!("duplicate IID {} in accessory {}", service.iid, accessory.aid);
            return Err(Error::InvalidData);
        }
        for (ci, characteristic) in service.characteristics.iter().enumerate() {
            if characteristic.iid == 0 {
                info!("characteristic IID must not be 0");
                return Err(Error::InvalidData);
            }
            if ble && characteristic.iid > u16::MAX as u64 {
                info!(
                    "characteristic IID {} does not fit the BLE wire format",
                    characteristic.iid
                );
                return Err(Error::InvalidData);
            }
            if seen(characteristic.iid, si, Some(ci)) {
                info!(
                    "duplicate IID {} in accessory {}",
                    characteristic.iid, accessory.aid
                );
                return Err(Error::InvalidData);
            }
        }
    }
    Ok(())
}

/// Resolves a `(service type, ordinal)` pair to the accessory and service it denotes.
///
/// The ordinal counts occurrences of the service type scanning the primary accessory first, then
/// the bridged accessories in order. This index is stable for a given attribute database and is
/// used by transports as a compact service identifier.
pub fn service_from_type_index<'t, 'a>(
    primary: &'t Accessory<'a>,
    bridged: &'t [&'t Accessory<'a>],
    uuid: &HapUuid,
    index: u16,
) -> Option<(&'t Accessory<'a>, &'t Service<'a>)> {
    let mut remaining = index;
    for accessory in core::iter::once(&primary).chain(bridged.iter()) {
        for service in accessory.services {
            if service.uuid == *uuid {
                if remaining == 0 {
                    return Some((*accessory, service));
                }
                remaining -= 1;
            }
        }
    }
    None
}

/// Computes the ordinal of `service` among all services of its type, inverse of
/// [`service_from_type_index`].
///
/// [`service_from_type_index`]: fn.service_from_type_index.html
pub fn service_type_index<'t, 'a>(
    primary: &'t Accessory<'a>,
    bridged: &'t [&'t Accessory<'a>],
    accessory: &'t Accessory<'a>,
    service: &'t Service<'a>,
) -> Option<u16> {
    let mut index = 0;
    for candidate_accessory in core::iter::once(&primary).chain(bridged.iter()) {
        for candidate in candidate_accessory.services {
            if core::ptr::eq(candidate, service)
                && core::ptr::eq(*candidate_accessory, accessory)
            {
                return Some(index);
            }
            if candidate.uuid == service.uuid {
                index += 1;
            }
        }
    }
    None
}

/// Identifies a characteristic for an application read or write.
pub struct CharacteristicRequest<'t, 'a> {
    /// The accessory that provides the service.
    pub accessory: &'t Accessory<'a>,
    /// The service that contains the characteristic.
    pub service: &'t Service<'a>,
    /// The characteristic being accessed.
    pub characteristic: &'t Characteristic<'a>,
    /// Whether the controller performing the access is an admin.
    pub is_admin: bool,
}

/// Application callbacks serving characteristic values.
///
/// Values cross this boundary in their wire serialization for the characteristic's [`Format`]
/// (little-endian integers, UTF-8 bytes, raw data). Validation of application-level constraints
/// is the implementor's responsibility; the stack enforces permissions and session security
/// before invoking these.
///
/// [`Format`]: enum.Format.html
pub trait AccessoryDelegate {
    /// Serves a read of a characteristic value, writing the value bytes into `value`.
    fn handle_read(
        &mut self,
        request: &CharacteristicRequest<'_, '_>,
        value: &mut ByteWriter<'_>,
    ) -> Result<(), Error>;

    /// Applies a write of a characteristic value.
    fn handle_write(
        &mut self,
        request: &CharacteristicRequest<'_, '_>,
        value: &[u8],
    ) -> Result<(), Error>;

    /// Informs the application that a controller subscribed to value changes.
    fn handle_subscribe(&mut self, _request: &CharacteristicRequest<'_, '_>) {}

    /// Informs the application that a controller unsubscribed from value changes.
    fn handle_unsubscribe(&mut self, _request: &CharacteristicRequest<'_, '_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn characteristic(iid: u64) -> Characteristic<'static> {
        Characteristic {
            iid,
            uuid: HapUuid::short(0x25),
            format: Format::Bool,
            properties: CharacteristicProperties::READABLE
                | CharacteristicProperties::WRITABLE,
            unit: Unit::None,
            constraints: Constraints::None,
            user_description: None,
        }
    }

    #[test]
    fn validates_iid_uniqueness() {
        let chars = [characteristic(2), characteristic(3)];
        let services = [Service {
            iid: 1,
            uuid: HapUuid::short(0x43),
            properties: ServiceProperties::PRIMARY,
            linked_services: &[],
            characteristics: &chars,
        }];
        let accessory = Accessory {
            aid: 1,
            category: 5,
            name: "Outlet",
            manufacturer: "Acme",
            model: "O1",
            serial_number: "0001",
            firmware_version: "1.0.0",
            services: &services,
        };
        validate_tree(&accessory, &[], true).unwrap();

        let dup_chars = [characteristic(2), characteristic(2)];
        let dup_services = [Service {
            iid: 1,
            uuid: HapUuid::short(0x43),
            properties: ServiceProperties::PRIMARY,
            linked_services: &[],
            characteristics: &dup_chars,
        }];
        let dup = Accessory {
            services: &dup_services,
            ..accessory
        };
        assert_eq!(validate_tree(&dup, &[], false), Err(Error::InvalidData));
    }

    #[test]
    fn ble_rejects_wide_iids() {
        let chars = [characteristic(0x1_0000)];
        let services = [Service {
            iid: 1,
            uuid: HapUuid::short(0x43),
            properties: ServiceProperties::PRIMARY,
            linked_services: &[],
            characteristics: &chars,
        }];
        let accessory = Accessory {
            aid: 1,
            category: 5,
            name: "Outlet",
            manufacturer: "Acme",
            model: "O1",
            serial_number: "0001",
            firmware_version: "1.0.0",
            services: &services,
        };
        assert_eq!(validate_tree(&accessory, &[], true), Err(Error::InvalidData));
        validate_tree(&accessory, &[], false).unwrap();
    }

    #[test]
    fn service_type_index_round_trips() {
        let chars_a = [characteristic(2)];
        let chars_b = [characteristic(12)];
        let chars_c = [characteristic(22)];
        let services_primary = [
            Service {
                iid: 1,
                uuid: HapUuid::short(0x43),
                properties: ServiceProperties::PRIMARY,
                linked_services: &[],
                characteristics: &chars_a,
            },
            Service {
                iid: 11,
                uuid: HapUuid::short(0x43),
                properties: ServiceProperties::empty(),
                linked_services: &[],
                characteristics: &chars_b,
            },
        ];
        let services_bridged = [Service {
            iid: 21,
            uuid: HapUuid::short(0x43),
            properties: ServiceProperties::PRIMARY,
            linked_services: &[],
            characteristics: &chars_c,
        }];
        let primary = Accessory {
            aid: 1,
            category: 2,
            name: "Bridge",
            manufacturer: "Acme",
            model: "B1",
            serial_number: "0002",
            firmware_version: "1.0.0",
            services: &services_primary,
        };
        let bridged_accessory = Accessory {
            aid: 2,
            category: 5,
            name: "Lamp",
            manufacturer: "Acme",
            model: "L1",
            serial_number: "0003",
            firmware_version: "1.0.0",
            services: &services_bridged,
        };
        let bridged = [&bridged_accessory];
        let uuid = HapUuid::short(0x43);

        for index in 0..3u16 {
            let (accessory, service) =
                service_from_type_index(&primary, &bridged, &uuid, index).unwrap();
            assert_eq!(
                service_type_index(&primary, &bridged, accessory, service),
                Some(index)
            );
        }
        assert!(service_from_type_index(&primary, &bridged, &uuid, 3).is_none());
    }
}
