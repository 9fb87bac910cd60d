use std::fmt;
use std::net::Ipv4Addr;

use crate::codec::{Reader, Writer};
use crate::{DecodeError, RECORD_LEN};

/// One NetFlow v5 flow record.
///
/// Field order matches the wire order, which is also the order used by the
/// [`fmt::Display`] rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Record {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub next_hop: u32,
    pub input_if: u16,
    pub output_if: u16,
    pub packet_count: u32,
    pub octet_count: u32,
    /// Exporter uptime (ms) at the first packet of the flow.
    pub first_seen_ms: u32,
    /// Exporter uptime (ms) at the last packet of the flow.
    pub last_seen_ms: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub pad1: u8,
    /// Cumulative OR of TCP flags.
    pub tcp_flags: u8,
    pub protocol: u8,
    pub tos: u8,
    pub src_as: u16,
    pub dst_as: u16,
    pub src_mask: u8,
    pub dst_mask: u8,
    pub pad2: u16,
}

impl Record {
    /// Decode one record from the first [`RECORD_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < RECORD_LEN {
            return Err(DecodeError::ShortBuffer {
                needed: RECORD_LEN,
                available: buf.len(),
            });
        }

        let mut r = Reader::new(&buf[..RECORD_LEN]);
        Ok(Self {
            src_addr: r.u32(),
            dst_addr: r.u32(),
            next_hop: r.u32(),
            input_if: r.u16(),
            output_if: r.u16(),
            packet_count: r.u32(),
            octet_count: r.u32(),
            first_seen_ms: r.u32(),
            last_seen_ms: r.u32(),
            src_port: r.u16(),
            dst_port: r.u16(),
            pad1: r.u8(),
            tcp_flags: r.u8(),
            protocol: r.u8(),
            tos: r.u8(),
            src_as: r.u16(),
            dst_as: r.u16(),
            src_mask: r.u8(),
            dst_mask: r.u8(),
            pad2: r.u16(),
        })
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        let mut w = Writer::new(&mut out);
        w.u32(self.src_addr);
        w.u32(self.dst_addr);
        w.u32(self.next_hop);
        w.u16(self.input_if);
        w.u16(self.output_if);
        w.u32(self.packet_count);
        w.u32(self.octet_count);
        w.u32(self.first_seen_ms);
        w.u32(self.last_seen_ms);
        w.u16(self.src_port);
        w.u16(self.dst_port);
        w.u8(self.pad1);
        w.u8(self.tcp_flags);
        w.u8(self.protocol);
        w.u8(self.tos);
        w.u16(self.src_as);
        w.u16(self.dst_as);
        w.u8(self.src_mask);
        w.u8(self.dst_mask);
        w.u16(self.pad2);
        debug_assert_eq!(w.position(), RECORD_LEN);
        out
    }

    /// Canonical single-line text form. Same as `to_string()`.
    pub fn render(&self) -> String {
        self.to_string()
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_addr)
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_addr)
    }

    pub fn next_hop_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.next_hop)
    }

    /// Flow duration in ms. Uptime counters wrap, so this does too.
    pub fn duration_ms(&self) -> u32 {
        self.last_seen_ms.wrapping_sub(self.first_seen_ms)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.src_addr,
            self.dst_addr,
            self.next_hop,
            self.input_if,
            self.output_if,
            self.packet_count,
            self.octet_count,
            self.first_seen_ms,
            self.last_seen_ms,
            self.src_port,
            self.dst_port,
            self.pad1,
            self.tcp_flags,
            self.protocol,
            self.tos,
            self.src_as,
            self.dst_as,
            self.src_mask,
            self.dst_mask,
            self.pad2,
        )
    }
}
