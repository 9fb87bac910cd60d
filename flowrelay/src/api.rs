use crate::state::{CollectorState, ExporterStats, ListenerPhase};
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub struct AppState {
    pub collector: Arc<CollectorState>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DropLabels {
    reason: String,
}

struct Metrics {
    registry: Registry,
    datagrams_total: Counter,
    bytes_total: Counter,
    records_total: Counter,
    receive_errors_total: Counter,
    dropped_total: Family<DropLabels, Counter>,
    exporters: Gauge,
    /// Held across a whole `sync` so concurrent scrapes apply each delta once.
    sync_lock: Mutex<()>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let datagrams_total = Counter::default();
        let bytes_total = Counter::default();
        let records_total = Counter::default();
        let receive_errors_total = Counter::default();
        let dropped_total = Family::<DropLabels, Counter>::default();
        let exporters = Gauge::default();

        registry.register(
            "flowrelay_datagrams",
            "Total number of received datagrams",
            datagrams_total.clone(),
        );
        registry.register(
            "flowrelay_bytes",
            "Total datagram bytes received",
            bytes_total.clone(),
        );
        registry.register(
            "flowrelay_records",
            "Flow records forwarded to the sink",
            records_total.clone(),
        );
        registry.register(
            "flowrelay_receive_errors",
            "Socket receive errors",
            receive_errors_total.clone(),
        );
        registry.register(
            "flowrelay_dropped_datagrams",
            "Datagrams dropped by decode failure",
            dropped_total.clone(),
        );
        registry.register(
            "flowrelay_exporters",
            "Exporters seen within the exporter timeout",
            exporters.clone(),
        );

        Self {
            registry,
            datagrams_total,
            bytes_total,
            records_total,
            receive_errors_total,
            dropped_total,
            exporters,
            sync_lock: Mutex::new(()),
        }
    }

    /// Counters are monotonic, so advance each one by its delta against the
    /// collector's absolute value.
    fn sync(&self, collector: &CollectorState) {
        fn catch_up(counter: &Counter, total: u64) {
            let current = counter.get();
            if total > current {
                counter.inc_by(total - current);
            }
        }

        // The lock guards no data, so a poisoned one is still usable.
        let _guard = self.sync_lock.lock().unwrap_or_else(|e| e.into_inner());

        catch_up(
            &self.datagrams_total,
            collector.datagrams_received.load(Ordering::Relaxed),
        );
        catch_up(
            &self.bytes_total,
            collector.bytes_received.load(Ordering::Relaxed),
        );
        catch_up(
            &self.records_total,
            collector.records_forwarded.load(Ordering::Relaxed),
        );
        catch_up(
            &self.receive_errors_total,
            collector.receive_errors.load(Ordering::Relaxed),
        );
        for (reason, counter) in [
            ("short_buffer", &collector.dropped_short_buffer),
            ("truncated_packet", &collector.dropped_truncated),
            ("policy", &collector.dropped_policy),
        ] {
            catch_up(
                &self.dropped_total.get_or_create(&DropLabels {
                    reason: reason.to_string(),
                }),
                counter.load(Ordering::Relaxed),
            );
        }
        self.exporters.set(collector.exporters.len() as i64);
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    listener: ListenerPhase,
    datagrams_received: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    datagrams_received: u64,
    bytes_received: u64,
    records_forwarded: u64,
    datagrams_dropped: u64,
    receive_errors: u64,
    exporters: usize,
    records_per_second: f64,
}

#[derive(Serialize)]
pub struct ExporterEntry {
    exporter: String,
    engine_type: u8,
    engine_id: u8,
    #[serde(flatten)]
    stats: ExporterStats,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/exporters", get(get_exporters))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| match s.parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(e) => {
                        tracing::warn!("ignoring invalid allowlist entry {}: {}", s, e);
                        None
                    }
                })
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let phase = state.collector.phase();
    let (code, status) = match phase {
        ListenerPhase::Serving => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            listener: phase,
            datagrams_received: state.collector.datagrams_received.load(Ordering::Relaxed),
        }),
    )
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let c = &state.collector;
    let uptime = state.start_time.elapsed().as_secs();
    let records_forwarded = c.records_forwarded.load(Ordering::Relaxed);

    let records_per_second = if uptime > 0 {
        records_forwarded as f64 / uptime as f64
    } else {
        0.0
    };

    Json(StatsResponse {
        uptime_seconds: uptime,
        datagrams_received: c.datagrams_received.load(Ordering::Relaxed),
        bytes_received: c.bytes_received.load(Ordering::Relaxed),
        records_forwarded,
        datagrams_dropped: c.datagrams_dropped(),
        receive_errors: c.receive_errors.load(Ordering::Relaxed),
        exporters: c.exporters.len(),
        records_per_second,
    })
}

async fn get_exporters(State(state): State<Arc<AppState>>) -> Json<Vec<ExporterEntry>> {
    let mut exporters: Vec<ExporterEntry> = state
        .collector
        .exporters
        .iter()
        .map(|entry| {
            let (key, stats) = entry.pair();
            ExporterEntry {
                exporter: key.addr.to_string(),
                engine_type: key.engine_type,
                engine_id: key.engine_id,
                stats: stats.clone(),
            }
        })
        .collect();

    exporters.sort_by(|a, b| b.stats.records.cmp(&a.stats.records));
    Json(exporters)
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    metrics.sync(&state.collector);

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("metrics encoding failed: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrelay_common::{DecodeError, Header};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve the router on an ephemeral loopback port.
    async fn spawn_api(collector: Arc<CollectorState>, allowed_ips: &[String]) -> SocketAddr {
        let state = Arc::new(AppState {
            collector,
            start_time: Instant::now(),
        });
        let app = router(state, allowed_ips);
        let http = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = http.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(http, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });
        addr
    }

    /// Minimal HTTP/1.1 GET; returns the status code and the raw response.
    async fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let code = response
            .split_whitespace()
            .nth(1)
            .and_then(|c| c.parse().ok())
            .unwrap();
        (code, response)
    }

    #[tokio::test]
    async fn test_health_unavailable_until_serving() {
        let collector = Arc::new(CollectorState::new());
        let addr = spawn_api(collector.clone(), &[]).await;

        let (code, body) = http_get(addr, "/api/health").await;
        assert_eq!(code, 503);
        assert!(body.contains("\"unavailable\""));

        collector.set_phase(ListenerPhase::Bound);
        assert_eq!(http_get(addr, "/api/health").await.0, 503);

        collector.set_phase(ListenerPhase::Serving);
        let (code, body) = http_get(addr, "/api/health").await;
        assert_eq!(code, 200);
        assert!(body.contains("\"ok\""));

        collector.set_phase(ListenerPhase::Stopped);
        assert_eq!(http_get(addr, "/api/health").await.0, 503);
    }

    #[tokio::test]
    async fn test_allowlist_rejects_outside_clients() {
        let collector = Arc::new(CollectorState::new());
        collector.set_phase(ListenerPhase::Serving);

        let denied = spawn_api(collector.clone(), &["10.0.0.0/8".to_string()]).await;
        assert_eq!(http_get(denied, "/api/health").await.0, 403);
        assert_eq!(http_get(denied, "/metrics").await.0, 403);

        let allowed = spawn_api(
            collector,
            &["10.0.0.0/8".to_string(), "127.0.0.0/8".to_string()],
        )
        .await;
        assert_eq!(http_get(allowed, "/api/health").await.0, 200);
        assert_eq!(http_get(allowed, "/api/stats").await.0, 200);
    }

    #[test]
    fn test_concurrent_sync_counts_once() {
        let collector = Arc::new(CollectorState::new());
        for _ in 0..1000 {
            collector.record_datagram(100);
        }
        let metrics = Arc::new(Metrics::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let collector = collector.clone();
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.sync(&collector);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.datagrams_total.get(), 1000);
        assert_eq!(metrics.bytes_total.get(), 100_000);
    }

    #[test]
    fn test_metrics_sync_and_encode() {
        let collector = CollectorState::new();
        collector.record_datagram(72);
        collector.record_forwarded(1);
        collector.record_drop(&DecodeError::TruncatedPacket {
            count: 2,
            expected: 96,
            available: 48,
        });
        collector.observe_header(
            "192.0.2.1:2055".parse().unwrap(),
            &Header {
                version: 5,
                count: 1,
                ..Default::default()
            },
        );

        let metrics = Metrics::new();
        metrics.sync(&collector);
        // Second sync with unchanged state must not double count.
        metrics.sync(&collector);

        let mut buf = String::new();
        encode(&mut buf, &metrics.registry).unwrap();
        assert!(buf.contains("flowrelay_datagrams_total 1"));
        assert!(buf.contains("flowrelay_bytes_total 72"));
        assert!(buf.contains("flowrelay_dropped_datagrams_total{reason=\"truncated_packet\"} 1"));
        assert!(buf.contains("flowrelay_exporters 1"));
    }
}
