//! HAP over Bluetooth Low Energy.
//!
//! The BLE transport maps the attribute database onto a GATT table and runs the HAP-PDU
//! procedure engine on top of plain GATT reads and writes: a controller writes request
//! fragments to a characteristic's value handle and reads response fragments back from the same
//! handle. Only the pairing characteristics are accessible without a secured session.
//!
//! Module map:
//!
//! * [`pdu`] — HAP-PDU opcodes, status codes, and the transaction assembler that reassembles
//!   fragmented request bodies and fragments response bodies.
//! * [`procedure`] — the procedure engine attached to one characteristic at a time, including
//!   Timed Write bookkeeping and the minimal fallback procedures.
//! * [`gatt`] — the published GATT table, per-connection characteristic state (CCCD
//!   subscriptions, pending events) and the GATT event entry points.
//! * [`session`] — per-link timers and terminal-state handling.
//!
//! [`pdu`]: pdu/index.html
//! [`procedure`]: procedure/index.html
//! [`gatt`]: gatt/index.html
//! [`session`]: session/index.html

pub mod gatt;
pub mod pdu;
pub mod procedure;
pub mod session;
