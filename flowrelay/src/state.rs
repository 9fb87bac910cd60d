use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tokio::time::Instant;

use flowrelay_common::{DecodeError, Header, Record};

/// Lifecycle of the datagram listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ListenerPhase {
    Created = 0,
    Bound = 1,
    Serving = 2,
    Stopped = 3,
}

impl ListenerPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ListenerPhase::Bound,
            2 => ListenerPhase::Serving,
            3 => ListenerPhase::Stopped,
            _ => ListenerPhase::Created,
        }
    }
}

/// JSON view of one record, enriched with exporter and header context.
#[derive(Debug, Clone, Serialize)]
pub struct FlowView {
    pub exporter: String,
    pub exported_at: Option<DateTime<Utc>>,
    pub flow_sequence: u32,
    pub sampling_rate: u16,
    pub src_ip: String,
    pub dst_ip: String,
    pub next_hop_ip: String,
    pub protocol_name: String,
    pub duration_ms: u32,
    #[serde(flatten)]
    pub record: Record,
}

impl FlowView {
    /// Combine a decoded record with the header it arrived under.
    ///
    /// `unix_nsecs` values of a second or more are invalid; the timestamp then
    /// falls back to whole seconds.
    pub fn from_record(exporter: SocketAddr, header: &Header, record: &Record) -> Self {
        let secs = i64::from(header.unix_secs);
        let exported_at = DateTime::from_timestamp(secs, header.unix_nsecs)
            .or_else(|| DateTime::from_timestamp(secs, 0));
        let protocol_name = match record.protocol {
            1 => "ICMP".to_string(),
            6 => "TCP".to_string(),
            17 => "UDP".to_string(),
            47 => "GRE".to_string(),
            50 => "ESP".to_string(),
            other => format!("IP({})", other),
        };
        Self {
            exporter: exporter.to_string(),
            exported_at,
            flow_sequence: header.flow_sequence,
            sampling_rate: header.sampling_rate(),
            src_ip: record.src_ip().to_string(),
            dst_ip: record.dst_ip().to_string(),
            next_hop_ip: record.next_hop_ip().to_string(),
            protocol_name,
            duration_ms: record.duration_ms(),
            record: *record,
        }
    }
}

/// One exporter is a source address plus the engine that produced the flows.
/// Sequence numbers are only meaningful per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExporterKey {
    pub addr: SocketAddr,
    pub engine_type: u8,
    pub engine_id: u8,
}

#[derive(Debug, Serialize, Clone)]
pub struct ExporterStats {
    pub datagrams: u64,
    pub records: u64,
    pub last_sequence: u32,
    /// Sum of forward gaps in `flow_sequence`.
    pub lost_flows: u64,
    /// Backward jumps, usually an exporter restart.
    pub sequence_resets: u64,
    #[serde(skip)]
    next_sequence: u32,
    #[serde(skip)]
    pub last_seen: Instant,
}

impl ExporterStats {
    fn first(header: &Header) -> Self {
        Self {
            datagrams: 1,
            records: u64::from(header.count),
            last_sequence: header.flow_sequence,
            lost_flows: 0,
            sequence_resets: 0,
            next_sequence: header.flow_sequence.wrapping_add(u32::from(header.count)),
            last_seen: Instant::now(),
        }
    }

    fn observe(&mut self, header: &Header) {
        let gap = header.flow_sequence.wrapping_sub(self.next_sequence);
        if gap != 0 {
            if gap < 1 << 31 {
                self.lost_flows += u64::from(gap);
            } else {
                self.sequence_resets += 1;
            }
        }
        self.datagrams += 1;
        self.records += u64::from(header.count);
        self.last_sequence = header.flow_sequence;
        self.next_sequence = header.flow_sequence.wrapping_add(u32::from(header.count));
        self.last_seen = Instant::now();
    }
}

/// Counters shared between the listener, the cleanup task and the API.
pub struct CollectorState {
    pub exporters: DashMap<ExporterKey, ExporterStats>,
    pub datagrams_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub records_forwarded: AtomicU64,
    pub receive_errors: AtomicU64,
    pub dropped_short_buffer: AtomicU64,
    pub dropped_truncated: AtomicU64,
    pub dropped_policy: AtomicU64,
    phase: AtomicU8,
}

impl CollectorState {
    pub fn new() -> Self {
        Self {
            exporters: DashMap::new(),
            datagrams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            records_forwarded: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            dropped_short_buffer: AtomicU64::new(0),
            dropped_truncated: AtomicU64::new(0),
            dropped_policy: AtomicU64::new(0),
            phase: AtomicU8::new(ListenerPhase::Created as u8),
        }
    }

    pub fn phase(&self) -> ListenerPhase {
        ListenerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: ListenerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn record_datagram(&self, len: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Account a successfully decoded header against its exporter.
    pub fn observe_header(&self, addr: SocketAddr, header: &Header) {
        let key = ExporterKey {
            addr,
            engine_type: header.engine_type,
            engine_id: header.engine_id,
        };
        self.exporters
            .entry(key)
            .and_modify(|stats| stats.observe(header))
            .or_insert_with(|| ExporterStats::first(header));
    }

    pub fn record_forwarded(&self, n: usize) {
        self.records_forwarded.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_drop(&self, err: &DecodeError) {
        let counter = match err {
            DecodeError::ShortBuffer { .. } => &self.dropped_short_buffer,
            DecodeError::TruncatedPacket { .. } => &self.dropped_truncated,
            DecodeError::UnsupportedVersion { .. }
            | DecodeError::TooManyRecords { .. }
            | DecodeError::TrailingBytes(_) => &self.dropped_policy,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagrams_dropped(&self) -> u64 {
        self.dropped_short_buffer.load(Ordering::Relaxed)
            + self.dropped_truncated.load(Ordering::Relaxed)
            + self.dropped_policy.load(Ordering::Relaxed)
    }

    pub fn cleanup_stale_exporters(&self, timeout: tokio::time::Duration) -> usize {
        let now = Instant::now();
        let before = self.exporters.len();
        self.exporters
            .retain(|_, stats| now.duration_since(stats.last_seen) <= timeout);
        before - self.exporters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn header(flow_sequence: u32, count: u16) -> Header {
        Header {
            version: 5,
            count,
            flow_sequence,
            unix_secs: 1_700_000_000,
            unix_nsecs: 500_000_000,
            ..Default::default()
        }
    }

    fn exporter() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    fn stats_for(state: &CollectorState, h: &Header) -> ExporterStats {
        let key = ExporterKey {
            addr: exporter(),
            engine_type: h.engine_type,
            engine_id: h.engine_id,
        };
        state.exporters.get(&key).unwrap().clone()
    }

    #[test]
    fn test_flow_view_enrichment() {
        let record = Record {
            src_addr: u32::from_be_bytes([10, 0, 0, 1]),
            dst_addr: u32::from_be_bytes([8, 8, 8, 8]),
            protocol: 17,
            first_seen_ms: 100,
            last_seen_ms: 350,
            ..Default::default()
        };
        let view = FlowView::from_record(exporter(), &header(7, 1), &record);

        assert_eq!(view.exporter, "192.0.2.10:40000");
        assert_eq!(view.src_ip, "10.0.0.1");
        assert_eq!(view.dst_ip, "8.8.8.8");
        assert_eq!(view.protocol_name, "UDP");
        assert_eq!(view.duration_ms, 250);
        assert_eq!(
            view.exported_at.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_500)
        );

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["protocol"], 17);
        assert_eq!(json["src_addr"], 167772161u64);
    }

    #[test]
    fn test_flow_view_bad_nanos() {
        let h = Header {
            unix_nsecs: 2_000_000_000,
            ..header(0, 1)
        };
        let view = FlowView::from_record(exporter(), &h, &Record::default());
        assert_eq!(
            view.exported_at.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
        assert_eq!(view.protocol_name, "IP(0)");
    }

    #[test]
    fn test_sequence_tracking() {
        let state = CollectorState::new();

        state.observe_header(exporter(), &header(100, 5));
        state.observe_header(exporter(), &header(105, 3));
        let s = stats_for(&state, &header(0, 0));
        assert_eq!(s.datagrams, 2);
        assert_eq!(s.records, 8);
        assert_eq!(s.lost_flows, 0);

        // 108 expected, 120 arrived: 12 flows lost in between.
        state.observe_header(exporter(), &header(120, 1));
        assert_eq!(stats_for(&state, &header(0, 0)).lost_flows, 12);

        // Exporter restart.
        state.observe_header(exporter(), &header(0, 1));
        let s = stats_for(&state, &header(0, 0));
        assert_eq!(s.sequence_resets, 1);
        assert_eq!(s.lost_flows, 12);
        assert_eq!(s.last_sequence, 0);
    }

    #[test]
    fn test_sequence_wraps() {
        let state = CollectorState::new();
        state.observe_header(exporter(), &header(u32::MAX - 1, 4));
        state.observe_header(exporter(), &header(2, 1));
        let s = stats_for(&state, &header(0, 0));
        assert_eq!(s.lost_flows, 0);
        assert_eq!(s.sequence_resets, 0);
    }

    #[test]
    fn test_engines_tracked_separately() {
        let state = CollectorState::new();
        let a = Header { engine_id: 1, ..header(10, 1) };
        let b = Header { engine_id: 2, ..header(500, 1) };
        state.observe_header(exporter(), &a);
        state.observe_header(exporter(), &b);
        assert_eq!(state.exporters.len(), 2);
        assert_eq!(stats_for(&state, &a).lost_flows, 0);
    }

    #[test]
    fn test_drop_counters() {
        let state = CollectorState::new();
        state.record_drop(&DecodeError::ShortBuffer { needed: 24, available: 3 });
        state.record_drop(&DecodeError::TrailingBytes(2));
        state.record_drop(&DecodeError::UnsupportedVersion { found: 9, expected: 5 });
        assert_eq!(state.dropped_short_buffer.load(Ordering::Relaxed), 1);
        assert_eq!(state.dropped_policy.load(Ordering::Relaxed), 2);
        assert_eq!(state.datagrams_dropped(), 3);
    }

    #[test]
    fn test_phase_round_trip() {
        let state = CollectorState::new();
        assert_eq!(state.phase(), ListenerPhase::Created);
        state.set_phase(ListenerPhase::Serving);
        assert_eq!(state.phase(), ListenerPhase::Serving);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_stale_exporters() {
        let state = CollectorState::new();
        state.observe_header(exporter(), &header(0, 1));
        assert_eq!(state.cleanup_stale_exporters(Duration::from_secs(60)), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(state.cleanup_stale_exporters(Duration::from_secs(60)), 1);
        assert!(state.exporters.is_empty());
    }
}
