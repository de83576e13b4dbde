//! The HAP TLV8 codec used on the wire by both transports.
//!
//! A TLV item is `<type:1> <length:1> <value:length>`. Values longer than 255 bytes are split
//! into consecutive fragments of the same type, where every fragment except the last carries
//! exactly 255 bytes. Zero-length items are permitted; the zero-length type `0xFF` is used as a
//! separator between repeated groups in a list.
//!
//! [`TlvReader`] reassembles long TLVs destructively inside the caller's buffer, which keeps the
//! stack free of intermediate allocations: merged values stay contiguous in place and the
//! vacated header bytes are zeroed. [`TlvWriter`] performs the reverse fragmentation.
//!
//! [`TlvReader`]: struct.TlvReader.html
//! [`TlvWriter`]: struct.TlvWriter.html

mod reader;
mod writer;

pub mod schema;

pub use self::reader::{ExpectedTlv, Tlv, TlvIndex, TlvReader};
pub use self::writer::TlvWriter;

/// Type byte of the zero-length TLV separating repeated groups in a list.
pub const SEPARATOR: u8 = 0xFF;
