use thiserror::Error;

/// Reasons a datagram (or a slice of one) fails to decode.
///
/// Every variant is local to a single datagram. None of them can be fixed by
/// reading more bytes, since datagrams are atomic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than a fixed-size structure requires.
    #[error("short buffer: need {needed} bytes, have {available}")]
    ShortBuffer { needed: usize, available: usize },

    /// The header declares more records than the datagram carries.
    #[error("truncated packet: {count} records need {expected} bytes after the header, have {available}")]
    TruncatedPacket {
        count: u16,
        expected: usize,
        available: usize,
    },

    /// Header version differs from the one the caller requires.
    #[error("unsupported version {found}, expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },

    /// Header count is above the caller's limit.
    #[error("record count {count} exceeds limit of {max}")]
    TooManyRecords { count: u16, max: u16 },

    /// Bytes left over after the last declared record, in strict mode.
    #[error("{0} unexpected bytes after the last record")]
    TrailingBytes(usize),
}

impl DecodeError {
    /// Short, stable label used for drop counters and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::ShortBuffer { .. } => "short_buffer",
            DecodeError::TruncatedPacket { .. } => "truncated_packet",
            DecodeError::UnsupportedVersion { .. } => "unsupported_version",
            DecodeError::TooManyRecords { .. } => "too_many_records",
            DecodeError::TrailingBytes(_) => "trailing_bytes",
        }
    }
}
