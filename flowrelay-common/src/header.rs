use crate::codec::{Reader, Writer};
use crate::{DecodeError, HEADER_LEN};

/// NetFlow v5 packet header. One per datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Header {
    pub version: u16,
    /// Number of records that follow the header.
    pub count: u16,
    pub sys_uptime_ms: u32,
    pub unix_secs: u32,
    pub unix_nsecs: u32,
    /// Total flows seen by the exporter before this datagram.
    pub flow_sequence: u32,
    pub engine_type: u8,
    pub engine_id: u8,
    /// Sampling mode in the top 2 bits, interval in the low 14.
    pub sampling_interval: u16,
}

impl Header {
    /// Decode the header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// The version is not checked here; that is a policy decision left to
    /// [`crate::DecodeOptions`].
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::ShortBuffer {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }

        let mut r = Reader::new(&buf[..HEADER_LEN]);
        Ok(Self {
            version: r.u16(),
            count: r.u16(),
            sys_uptime_ms: r.u32(),
            unix_secs: r.u32(),
            unix_nsecs: r.u32(),
            flow_sequence: r.u32(),
            engine_type: r.u8(),
            engine_id: r.u8(),
            sampling_interval: r.u16(),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut w = Writer::new(&mut out);
        w.u16(self.version);
        w.u16(self.count);
        w.u32(self.sys_uptime_ms);
        w.u32(self.unix_secs);
        w.u32(self.unix_nsecs);
        w.u32(self.flow_sequence);
        w.u8(self.engine_type);
        w.u8(self.engine_id);
        w.u16(self.sampling_interval);
        debug_assert_eq!(w.position(), HEADER_LEN);
        out
    }

    /// Sampling mode from the top 2 bits of `sampling_interval`.
    pub fn sampling_mode(&self) -> u8 {
        (self.sampling_interval >> 14) as u8
    }

    /// One-in-N sampling rate. An interval of 0 means every packet was seen.
    pub fn sampling_rate(&self) -> u16 {
        match self.sampling_interval & 0x3fff {
            0 => 1,
            n => n,
        }
    }
}
