//! An embedded HomeKit Accessory Protocol (HAP) stack.
//!
//! Implements the accessory side of HAP over both supported transports: HAP over Bluetooth Low
//! Energy and HAP over IP. The stack covers the session security channel (Pair Setup via SRP-6a,
//! Pair Verify via X25519 + Ed25519, ChaCha20-Poly1305 transport encryption, Pair Resume), the
//! persistent pairing database, the accessory attribute model, the BLE HAP-PDU procedure engine
//! and the IP frame encryption layer.
//!
//! # Using the stack
//!
//! Hearth is runtime and hardware-agnostic: It does not need an RTOS (although you can certainly
//! use one if you want) and provides platform interfaces that need to be implemented once for
//! every supported target. The integrator supplies:
//!
//! * A synchronous [`KeyValueStore`] for the pairing database and accessory configuration.
//! * A millisecond-precision [`Clock`].
//! * A [`BlePeripheral`] wrapping the target's GATT server (for HAP over BLE).
//! * A cryptographically secure RNG implementing [`rand_core`]'s traits.
//!
//! All timer handling is deadline-based: the stack records deadlines and exposes the earliest one,
//! and the platform calls back into `poll` functions when it elapses. No callbacks are stored.
//!
//! [`KeyValueStore`]: platform/trait.KeyValueStore.html
//! [`Clock`]: platform/trait.Clock.html
//! [`BlePeripheral`]: platform/trait.BlePeripheral.html
//! [`rand_core`]: https://docs.rs/rand_core

#![cfg_attr(not(test), no_std)]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod accessory;
pub mod ble;
mod bytes;
pub mod crypto;
mod error;
pub mod ip;
pub mod mfi;
pub mod pairing;
pub mod platform;
pub mod server;
pub mod session;
pub mod setup;
pub mod time;
pub mod tlv;
pub mod uuid;

pub use self::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
pub use self::error::Error;

/// Revision of the HomeKit Accessory Protocol implemented by Hearth.
pub const HAP_PROTOCOL_VERSION: &str = "2.2.0";
