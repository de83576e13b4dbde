//! Platform interfaces the stack needs the integrator to provide.
//!
//! Hearth does not talk to hardware or an OS directly. Every target supplies implementations of
//! the traits in this module once, and aggregates them in a [`Platform`] configuration type that
//! is threaded through the stack as a single type parameter.
//!
//! Rather than storing callbacks, the stack is driven by the platform: GATT events are delivered
//! by calling the corresponding `AccessoryServer::ble_handle_*` methods, and timeouts are
//! delivered by calling the `poll` methods when a deadline reported by the stack elapses.

use crate::time::Instant;
use crate::uuid::HapUuid;
use crate::Error;
use rand_core::{CryptoRng, RngCore};

/// Trait for Hearth platform configurations.
///
/// This trait defines a number of types to be used throughout the layers of the HAP stack, which
/// define capabilities, data structures, and hardware interface types to be used.
///
/// Every application must define a type implementing this trait and supply it to the stack.
pub trait Platform {
    /// The persistent key-value store holding pairings and accessory configuration.
    type Store: KeyValueStore;

    /// A time source with millisecond resolution.
    type Clock: Clock;

    /// A cryptographically secure random number generator.
    type Rng: RngCore + CryptoRng;

    /// The BLE peripheral (GATT server) wrapper, for HAP over Bluetooth LE.
    ///
    /// Use [`NoBlePeripheral`] when the accessory is IP-only.
    type Ble: BlePeripheral;

    /// The Apple Authentication Coprocessor, if one is fitted.
    ///
    /// Use [`NoMfiCoprocessor`] when there is none.
    type Mfi: MfiCoprocessor;
}

/// Trait for time providers.
///
/// The platform has to provide an implementation of `Clock` to the stack. The implementation must
/// have millisecond accuracy.
///
/// This trait can also be implemented by a mock clock for testing.
pub trait Clock {
    /// Obtain the current time as an [`Instant`].
    ///
    /// The [`Instant`]s returned by this function must never move backwards in time.
    ///
    /// [`Instant`]: ../time/struct.Instant.html
    fn now(&self) -> Instant;
}

/// A key-value store domain.
///
/// Domains partition the store into independent key spaces that can be purged as a unit.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Domain(pub u8);

/// A key within a key-value store domain.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, PartialOrd, Ord)]
pub struct Key(pub u8);

/// Key-value store domains used by the stack.
pub mod domains {
    use super::Domain;

    /// Accessory configuration (identity, firmware version, configuration number).
    pub const CONFIGURATION: Domain = Domain(0x00);

    /// Paired controllers. Keys are indices `0..max_pairings`.
    pub const PAIRINGS: Domain = Domain(0x10);
}

/// Keys within [`domains::CONFIGURATION`].
pub mod config_keys {
    use super::Key;

    /// The accessory's long-term Ed25519 secret key (32 bytes).
    pub const LTSK: Key = Key(0x00);

    /// The persisted firmware version triple (3x u32 little-endian).
    pub const FIRMWARE_VERSION: Key = Key(0x01);

    /// The configuration number (u32 little-endian).
    pub const CONFIGURATION_NUMBER: Key = Key(0x02);

    /// BLE broadcast encryption key and advertising identifier.
    pub const BLE_BROADCAST_PARAMETERS: Key = Key(0x03);
}

/// A synchronous persistent key-value store.
///
/// This is the single serialization point for persistent data. It is only accessed from callback
/// context; all operations complete before returning. Store failures are reported as
/// [`Error::Unknown`] and treated as fatal on critical paths.
pub trait KeyValueStore {
    /// Reads the value stored under `domain`/`key` into `buf`.
    ///
    /// Returns `None` if no value is stored, and `Some(len)` with the number of bytes copied
    /// otherwise. Values longer than `buf` are truncated to `buf.len()`.
    fn get(&mut self, domain: Domain, key: Key, buf: &mut [u8]) -> Result<Option<usize>, Error>;

    /// Stores `value` under `domain`/`key`, replacing any previous value.
    fn set(&mut self, domain: Domain, key: Key, value: &[u8]) -> Result<(), Error>;

    /// Removes the value stored under `domain`/`key`. Removing a missing value is not an error.
    fn remove(&mut self, domain: Domain, key: Key) -> Result<(), Error>;

    /// Removes all values stored under `domain`.
    fn purge_domain(&mut self, domain: Domain) -> Result<(), Error>;

    /// Calls `f` with every `(key, value)` stored under `domain`, in unspecified order.
    ///
    /// Enumeration stops early when `f` returns `false`.
    fn enumerate(
        &mut self,
        domain: Domain,
        f: &mut dyn FnMut(Key, &[u8]) -> bool,
    ) -> Result<(), Error>;
}

/// Handle identifying a central connection on the BLE peripheral.
pub type ConnectionHandle = u16;

/// Handle identifying an attribute in the published GATT database.
pub type AttributeHandle = u16;

bitflags::bitflags! {
    /// GATT properties of a characteristic or descriptor being registered.
    pub struct GattProperties: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const INDICATE = 1 << 2;
    }
}

/// Trait for BLE peripheral (GATT server) wrappers.
///
/// GATT payloads are uninterpreted bytes at this layer; the HAP-PDU interpretation happens inside
/// the stack. The platform delivers connect/disconnect/read/write/ready-to-indicate events by
/// calling the corresponding `AccessoryServer::ble_handle_*` methods.
pub trait BlePeripheral {
    /// Starts a new service declaration in the GATT database being assembled.
    fn add_service(&mut self, uuid: &HapUuid, primary: bool) -> Result<(), Error>;

    /// Adds a characteristic to the service currently being assembled.
    ///
    /// Returns the attribute handle of the characteristic value, and the handle of the Client
    /// Characteristic Configuration descriptor if `properties` contains `INDICATE`.
    fn add_characteristic(
        &mut self,
        uuid: &HapUuid,
        properties: GattProperties,
        initial_value: &[u8],
    ) -> Result<(AttributeHandle, Option<AttributeHandle>), Error>;

    /// Adds a descriptor to the characteristic currently being assembled.
    fn add_descriptor(
        &mut self,
        uuid: &HapUuid,
        properties: GattProperties,
        initial_value: &[u8],
    ) -> Result<AttributeHandle, Error>;

    /// Publishes the assembled GATT database. No further attributes may be added afterwards.
    fn publish_services(&mut self) -> Result<(), Error>;

    /// Removes all published services.
    fn remove_all_services(&mut self) -> Result<(), Error>;

    /// Sends a Handle Value Indication for `handle` to the connected central.
    ///
    /// Returns [`Error::InvalidState`] when the stack should retry after the next
    /// ready-to-indicate event.
    fn send_indication(
        &mut self,
        connection: ConnectionHandle,
        handle: AttributeHandle,
        payload: &[u8],
    ) -> Result<(), Error>;

    /// Tears down the connection to the central.
    fn cancel_connection(&mut self, connection: ConnectionHandle) -> Result<(), Error>;
}

/// Trait for Apple Authentication Coprocessor (MFi) drivers.
///
/// The driver moves raw register bytes over the accessory's I2C (or equivalent) bus; the register
/// protocol state machine lives in the [`mfi`] module.
///
/// [`mfi`]: ../mfi/index.html
pub trait MfiCoprocessor {
    /// Powers the coprocessor on. Must be callable when already powered.
    fn power_on(&mut self) -> Result<(), Error>;

    /// Powers the coprocessor off.
    fn power_off(&mut self);

    /// Writes `bytes` to the coprocessor. The first byte selects the register.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Reads `buf.len()` bytes from `register`.
    fn read(&mut self, register: u8, buf: &mut [u8]) -> Result<(), Error>;
}

/// Placeholder BLE peripheral for IP-only accessories.
///
/// All operations panic; the stack never calls them unless a BLE transport was configured.
pub struct NoBlePeripheral;

impl BlePeripheral for NoBlePeripheral {
    fn add_service(&mut self, _uuid: &HapUuid, _primary: bool) -> Result<(), Error> {
        unreachable!("no BLE peripheral configured")
    }

    fn add_characteristic(
        &mut self,
        _uuid: &HapUuid,
        _properties: GattProperties,
        _initial_value: &[u8],
    ) -> Result<(AttributeHandle, Option<AttributeHandle>), Error> {
        unreachable!("no BLE peripheral configured")
    }

    fn add_descriptor(
        &mut self,
        _uuid: &HapUuid,
        _properties: GattProperties,
        _initial_value: &[u8],
    ) -> Result<AttributeHandle, Error> {
        unreachable!("no BLE peripheral configured")
    }

    fn publish_services(&mut self) -> Result<(), Error> {
        unreachable!("no BLE peripheral configured")
    }

    fn remove_all_services(&mut self) -> Result<(), Error> {
        unreachable!("no BLE peripheral configured")
    }

    fn send_indication(
        &mut self,
        _connection: ConnectionHandle,
        _handle: AttributeHandle,
        _payload: &[u8],
    ) -> Result<(), Error> {
        unreachable!("no BLE peripheral configured")
    }

    fn cancel_connection(&mut self, _connection: ConnectionHandle) -> Result<(), Error> {
        unreachable!("no BLE peripheral configured")
    }
}

/// In-memory fakes for exercising the stack in tests.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::time::Instant;
    use core::cell::Cell;
    use std::collections::BTreeMap;
    use std::vec::Vec;

    /// A `KeyValueStore` backed by a `BTreeMap`.
    pub struct MemoryStore {
        items: BTreeMap<(u8, u8), Vec<u8>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            MemoryStore {
                items: BTreeMap::new(),
            }
        }

        /// Number of values stored in `domain`.
        pub fn count(&self, domain: Domain) -> usize {
            self.items.keys().filter(|(d, _)| *d == domain.0).count()
        }
    }

    impl KeyValueStore for MemoryStore {
        fn get(&mut self, domain: Domain, key: Key, buf: &mut [u8]) -> Result<Option<usize>, Error> {
            match self.items.get(&(domain.0, key.0)) {
                None => Ok(None),
                Some(value) => {
                    let len = value.len().min(buf.len());
                    buf[..len].copy_from_slice(&value[..len]);
                    Ok(Some(len))
                }
            }
        }

        fn set(&mut self, domain: Domain, key: Key, value: &[u8]) -> Result<(), Error> {
            self.items.insert((domain.0, key.0), value.to_vec());
            Ok(())
        }

        fn remove(&mut self, domain: Domain, key: Key) -> Result<(), Error> {
            self.items.remove(&(domain.0, key.0));
            Ok(())
        }

        fn purge_domain(&mut self, domain: Domain) -> Result<(), Error> {
            self.items.retain(|(d, _), _| *d != domain.0);
            Ok(())
        }

        fn enumerate(
            &mut self,
            domain: Domain,
            f: &mut dyn FnMut(Key, &[u8]) -> bool,
        ) -> Result<(), Error> {
            for ((d, k), value) in &self.items {
                if *d != domain.0 {
                    continue;
                }
                if !f(Key(*k), value) {
                    break;
                }
            }
            Ok(())
        }
    }

    /// A manually advanced clock.
    pub struct FakeClock {
        now: Cell<u64>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            FakeClock { now: Cell::new(0) }
        }

        pub fn advance(&self, millis: u64) {
            self.now.set(self.now.get() + millis);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            Instant::from_raw_millis(self.now.get())
        }
    }

    /// A deterministic xorshift RNG. Do not use outside of tests.
    pub struct SeqRng(pub u64);

    impl RngCore for SeqRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            let mut x = self.0.wrapping_add(0x9e3779b97f4a7c15);
            self.0 = x;
            x ^= x >> 30;
            x = x.wrapping_mul(0xbf58476d1ce4e5b9);
            x ^= x >> 27;
            x = x.wrapping_mul(0x94d049bb133111eb);
            x ^ (x >> 31)
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            rand_core::impls::fill_bytes_via_next(self, dest)
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for SeqRng {}
}

/// Placeholder coprocessor for accessories without Apple Authentication hardware.
pub struct NoMfiCoprocessor;

impl MfiCoprocessor for NoMfiCoprocessor {
    fn power_on(&mut self) -> Result<(), Error> {
        Err(Error::InvalidState)
    }

    fn power_off(&mut self) {}

    fn write(&mut self, _bytes: &[u8]) -> Result<(), Error> {
        Err(Error::InvalidState)
    }

    fn read(&mut self, _register: u8, _buf: &mut [u8]) -> Result<(), Error> {
        Err(Error::InvalidState)
    }
}

