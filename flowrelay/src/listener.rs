use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use flowrelay_common::{DecodeOptions, Header, Packet, Record};

use crate::config::{Config, OutputFormat};
use crate::state::{CollectorState, FlowView, ListenerPhase};

/// Socket setup failed. Fatal to startup; never retried here.
#[derive(Error, Debug)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    pub decode: DecodeOptions,
    pub format: OutputFormat,
    pub max_datagram_size: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            decode: DecodeOptions::netflow_v5(),
            format: OutputFormat::Text,
            max_datagram_size: 65535,
        }
    }
}

impl From<&Config> for ListenerOptions {
    fn from(config: &Config) -> Self {
        Self {
            decode: config.decode_options(),
            format: config.output_format,
            max_datagram_size: config.max_datagram_size,
        }
    }
}

/// A bound NetFlow v5 receiver. Owns its socket exclusively.
pub struct Listener {
    socket: UdpSocket,
    local_addr: SocketAddr,
    options: ListenerOptions,
    state: Arc<CollectorState>,
}

impl Listener {
    pub async fn bind(
        addr: &str,
        options: ListenerOptions,
        state: Arc<CollectorState>,
    ) -> Result<Self, BindError> {
        let bind_err = |source| BindError {
            addr: addr.to_string(),
            source,
        };
        let socket = UdpSocket::bind(addr).await.map_err(bind_err)?;
        let local_addr = socket.local_addr().map_err(bind_err)?;

        state.set_phase(ListenerPhase::Bound);
        tracing::info!("NetFlow listener bound to udp://{}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            options,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive, decode and forward datagrams until `shutdown` fires or the
    /// receiving side of `tx` goes away.
    ///
    /// A datagram that was already received is fully forwarded before the
    /// token is checked again. The socket is closed on return.
    pub async fn serve(self, tx: mpsc::Sender<String>, shutdown: CancellationToken) {
        self.state.set_phase(ListenerPhase::Serving);
        let mut buffer = vec![0_u8; self.options.max_datagram_size];

        loop {
            let (received, source) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("listener shutdown requested");
                    break;
                }
                recv = self.socket.recv_from(&mut buffer) => match recv {
                    Ok(result) => result,
                    Err(err) => {
                        self.state.receive_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        tracing::warn!("udp recv error: {}", err);
                        continue;
                    }
                },
            };

            self.state.record_datagram(received);
            if !self.dispatch(&buffer[..received], source, &tx).await {
                tracing::info!("delivery channel closed, stopping listener");
                break;
            }
        }

        let Listener {
            socket,
            local_addr,
            state,
            ..
        } = self;
        drop(socket);
        state.set_phase(ListenerPhase::Stopped);
        tracing::info!("NetFlow listener on udp://{} stopped", local_addr);
    }

    /// Decode one datagram and forward its records in wire order. Returns
    /// false once the channel is closed.
    async fn dispatch(
        &self,
        datagram: &[u8],
        source: SocketAddr,
        tx: &mpsc::Sender<String>,
    ) -> bool {
        let packet = match Packet::decode_with(datagram, &self.options.decode) {
            Ok(packet) => packet,
            Err(err) => {
                self.state.record_drop(&err);
                tracing::debug!(
                    %source,
                    kind = err.kind(),
                    len = datagram.len(),
                    "dropping datagram: {}",
                    err
                );
                return true;
            }
        };

        self.state.observe_header(source, &packet.header);
        tracing::trace!(
            %source,
            count = packet.header.count,
            sequence = packet.header.flow_sequence,
            "decoded datagram"
        );

        for record in &packet.records {
            let line = self.render(source, &packet.header, record);
            if tx.send(line).await.is_err() {
                return false;
            }
            self.state.record_forwarded(1);
        }
        true
    }

    fn render(&self, source: SocketAddr, header: &Header, record: &Record) -> String {
        match self.options.format {
            OutputFormat::Text => record.render(),
            OutputFormat::Json => {
                let view = FlowView::from_record(source, header, record);
                match serde_json::to_string(&view) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::warn!("json encoding failed, falling back to text: {}", err);
                        record.render()
                    }
                }
            }
        }
    }
}
