use crate::{DecodeError, Header, Record, HEADER_LEN, RECORD_LEN};

/// A decoded datagram: the header and exactly `header.count` records, in
/// wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Packet {
    pub header: Header,
    pub records: Vec<Record>,
}

/// Caller policy applied on top of the structural checks.
///
/// `DecodeOptions::default()` is the lenient decode: any version, any count
/// the datagram can hold, trailing bytes ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Reject headers whose version differs from this one.
    pub require_version: Option<u16>,
    /// Reject headers whose count is above this limit.
    pub max_records: Option<u16>,
    /// Accept bytes after the last declared record.
    pub allow_trailing_bytes: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            require_version: None,
            max_records: None,
            allow_trailing_bytes: true,
        }
    }
}

impl DecodeOptions {
    /// Version 5 only, at most [`crate::MAX_RECORDS`] records, trailing
    /// padding tolerated.
    pub fn netflow_v5() -> Self {
        Self {
            require_version: Some(crate::NETFLOW_V5_VERSION),
            max_records: Some(crate::MAX_RECORDS),
            allow_trailing_bytes: true,
        }
    }

    fn check_header(&self, header: &Header) -> Result<(), DecodeError> {
        if let Some(expected) = self.require_version {
            if header.version != expected {
                return Err(DecodeError::UnsupportedVersion {
                    found: header.version,
                    expected,
                });
            }
        }
        if let Some(max) = self.max_records {
            if header.count > max {
                return Err(DecodeError::TooManyRecords {
                    count: header.count,
                    max,
                });
            }
        }
        Ok(())
    }
}

impl Packet {
    /// Build a packet whose header count matches `records`.
    ///
    /// Records past `u16::MAX` are dropped so the count always describes the
    /// body that `encode` writes.
    pub fn new(mut header: Header, mut records: Vec<Record>) -> Self {
        records.truncate(usize::from(u16::MAX));
        header.count = records.len() as u16;
        Self { header, records }
    }

    /// Lenient decode: header, then `count` records, extra bytes ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_with(buf, &DecodeOptions::default())
    }

    pub fn decode_with(buf: &[u8], opts: &DecodeOptions) -> Result<Self, DecodeError> {
        let header = Header::decode(buf)?;
        opts.check_header(&header)?;

        let body = &buf[HEADER_LEN..];
        let expected = usize::from(header.count) * RECORD_LEN;
        if body.len() < expected {
            return Err(DecodeError::TruncatedPacket {
                count: header.count,
                expected,
                available: body.len(),
            });
        }
        if !opts.allow_trailing_bytes && body.len() > expected {
            return Err(DecodeError::TrailingBytes(body.len() - expected));
        }

        let records = body[..expected]
            .chunks_exact(RECORD_LEN)
            .map(Record::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { header, records })
    }

    /// Wire bytes: the header as stored, followed by every record.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.records.len() * RECORD_LEN);
        out.extend_from_slice(&self.header.encode());
        for record in &self.records {
            out.extend_from_slice(&record.encode());
        }
        out
    }
}
