//! NetFlow v5 wire format: header and flow record layouts, decode/encode
//! between bytes and typed values, and the canonical text rendering of a
//! record.
//!
//! Everything here is pure. Socket handling lives in the `flowrelay` binary.
//!
//! All multi-byte fields are big-endian (network byte order). Layouts are
//! written out field by field rather than copied from a `#[repr(C)]` struct,
//! so the in-memory layout of [`Header`] and [`Record`] has no bearing on the
//! bytes on the wire.

mod codec;
mod error;
mod header;
mod packet;
mod record;

pub use error::DecodeError;
pub use header::Header;
pub use packet::{DecodeOptions, Packet};
pub use record::Record;

/// The only wire format version this crate understands.
pub const NETFLOW_V5_VERSION: u16 = 5;

/// Size of the packet header on the wire.
pub const HEADER_LEN: usize = 24;

/// Size of one flow record on the wire.
pub const RECORD_LEN: usize = 48;

/// Largest record count an exporter may put in one datagram.
pub const MAX_RECORDS: u16 = 30;
