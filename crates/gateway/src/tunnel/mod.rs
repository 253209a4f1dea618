//! Per-tunnel request/stream multiplexer.
//!
//! One [`Tunnel`] wraps one accepted connector connection, whatever
//! its transport. Callers issue commands and open chunk streams; the
//! single inbound loop dispatches replies and chunks to them by
//! request id. Transports implement only framing ([`TunnelSink`] /
//! [`TunnelStream`]); everything else lives here.

pub mod grpc;
pub mod ws;

use crate::error::{GatewayError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use common::messages::{self, ConnectorFrame, GatewayCommand, REQUEST_ID_LEN};
use metrics::counter;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound of a chunk sink. This is the backpressure window: a full
/// sink means a slow consumer, and new chunks are dropped rather than
/// buffered without bound.
pub const CHUNK_SINK_CAPACITY: usize = 100;

/// A sink bound below this cannot absorb the ack/data interleaving.
const MIN_CHUNK_SINK_CAPACITY: usize = 2;

/// How long a command waits for its reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long a freshly-accepted connection has to register.
pub(super) const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport variant carrying a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    GrpcBidi,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::GrpcBidi => write!(f, "grpc-bidi"),
        }
    }
}

/// One frame on a tunnel. Structured-only transports never produce
/// or accept `Binary`.
#[derive(Debug)]
pub enum TunnelFrame {
    Text(String),
    Binary(Bytes),
}

/// Write half of a tunnel transport.
#[async_trait::async_trait]
pub trait TunnelSink: Send {
    async fn send(&mut self, frame: TunnelFrame) -> Result<()>;
}

/// Read half of a tunnel transport. `Ok(None)` is a clean EOF.
#[async_trait::async_trait]
pub trait TunnelStream: Send {
    async fn recv(&mut self) -> Result<Option<TunnelFrame>>;
}

/// A live connector tunnel with its multiplexing state.
pub struct Tunnel {
    id: String,
    tenant_id: String,
    connector_id: String,
    kind: TransportKind,
    /// The per-tunnel write lock. All writes go through it; nothing
    /// else is held while writing.
    writer: Mutex<Box<dyn TunnelSink>>,
    /// request id → single-shot reply slot.
    pending: RwLock<HashMap<String, oneshot::Sender<ConnectorFrame>>>,
    /// request id → bounded chunk sink.
    chunks: RwLock<HashMap<String, mpsc::Sender<Bytes>>>,
    closed: CancellationToken,
}

impl Tunnel {
    pub fn new(
        kind: TransportKind,
        tenant_id: impl Into<String>,
        connector_id: impl Into<String>,
        writer: Box<dyn TunnelSink>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            connector_id: connector_id.into(),
            kind,
            writer: Mutex::new(writer),
            pending: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Tunnel identity, distinct from the connector's own id. Used by
    /// the registry to tell a stale unregister from a live entry.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send a command that expects no reply (registration outcome,
    /// heartbeat).
    pub async fn send_control(&self, cmd: &GatewayCommand) -> Result<()> {
        let json = serde_json::to_string(cmd)?;
        self.write_frame(TunnelFrame::Text(json)).await
    }

    /// Send a command and wait for the correlated reply.
    pub async fn send_command(&self, cmd: &GatewayCommand) -> Result<ConnectorFrame> {
        let request_id = cmd
            .request_id()
            .ok_or_else(|| GatewayError::Internal("command carries no request id".to_string()))?
            .to_string();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.write().unwrap();
            if pending.contains_key(&request_id) {
                return Err(GatewayError::DuplicateRequestId(request_id));
            }
            pending.insert(request_id.clone(), tx);
        }
        let _guard = PendingGuard {
            tunnel: self,
            request_id: &request_id,
        };

        let json = serde_json::to_string(cmd)?;
        self.write_frame(TunnelFrame::Text(json)).await?;

        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            // Slot dropped without delivery: the tunnel tore down.
            Ok(Err(_)) => Err(GatewayError::TunnelClosed),
            Err(_) => Err(GatewayError::ReplyTimeout(request_id.clone())),
        }
    }

    /// Register a chunk sink for the command's request id, then issue
    /// the command. The returned stream yields chunks in connector
    /// emission order and ends when the connector signals
    /// `stream_end` (or the tunnel tears down). Dropping the stream
    /// releases the sink.
    pub async fn open_stream(self: &Arc<Self>, cmd: &GatewayCommand) -> Result<ChunkStream> {
        let request_id = cmd
            .request_id()
            .ok_or_else(|| GatewayError::Internal("command carries no request id".to_string()))?
            .to_string();

        let (tx, rx) = mpsc::channel(CHUNK_SINK_CAPACITY.max(MIN_CHUNK_SINK_CAPACITY));
        {
            let mut chunks = self.chunks.write().unwrap();
            if chunks.contains_key(&request_id) {
                return Err(GatewayError::DuplicateRequestId(request_id));
            }
            chunks.insert(request_id.clone(), tx);
        }
        let stream = ChunkStream {
            tunnel: Arc::clone(self),
            request_id,
            rx,
        };

        // If the command fails the stream drops here, releasing the sink.
        let reply = self.send_command(cmd).await?;
        match &reply {
            ConnectorFrame::StreamStatus(status) => {
                if let Some(error) = &status.status.error {
                    return Err(GatewayError::Connector(error.clone()));
                }
            }
            ConnectorFrame::FlightInfo(info) if info.is_error() => {
                let reason = info
                    .error
                    .clone()
                    .unwrap_or_else(|| "stream request failed".to_string());
                return Err(GatewayError::Connector(reason));
            }
            _ => {}
        }

        Ok(stream)
    }

    async fn write_frame(&self, frame: TunnelFrame) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::TunnelClosed);
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(frame).await {
            drop(writer);
            warn!(tenant_id = %self.tenant_id, "tunnel write failed: {e}");
            self.shutdown();
            return Err(e);
        }
        Ok(())
    }

    /// Inbound loop: the sole dispatcher for this tunnel. Also emits
    /// the outbound heartbeat. Returns when the connection ends, after
    /// tearing down all multiplexing state.
    pub async fn run(self: Arc<Self>, mut reader: Box<dyn TunnelStream>) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.reset();

        loop {
            tokio::select! {
                biased;

                _ = self.closed.cancelled() => break,

                _ = heartbeat.tick() => {
                    let cmd = GatewayCommand::Heartbeat { timestamp: Utc::now().timestamp() };
                    let json = serde_json::to_string(&cmd).expect("heartbeat serialization cannot fail");
                    if self.write_frame(TunnelFrame::Text(json)).await.is_err() {
                        break;
                    }
                }

                frame = reader.recv() => match frame {
                    Ok(Some(TunnelFrame::Text(text))) => self.dispatch_text(&text),
                    Ok(Some(TunnelFrame::Binary(data))) => self.dispatch_binary(data),
                    Ok(None) => {
                        info!(tenant_id = %self.tenant_id, "tunnel closed by connector");
                        break;
                    }
                    Err(e) => {
                        warn!(tenant_id = %self.tenant_id, "tunnel read error: {e}");
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    /// Cancel the tunnel and fail everything in flight: pending reply
    /// waiters wake with a tunnel-closed error, chunk sinks end.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.closed.cancel();
        let pending_count;
        let chunk_count;
        {
            let mut pending = self.pending.write().unwrap();
            pending_count = pending.len();
            pending.clear();
        }
        {
            let mut chunks = self.chunks.write().unwrap();
            chunk_count = chunks.len();
            chunks.clear();
        }
        if pending_count > 0 || chunk_count > 0 {
            warn!(
                tenant_id = %self.tenant_id,
                pending = pending_count,
                streams = chunk_count,
                "tunnel shut down with work in flight"
            );
        }
    }

    fn dispatch_text(&self, text: &str) {
        let frame: ConnectorFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(tenant_id = %self.tenant_id, "unparseable tunnel frame: {e}");
                return;
            }
        };

        match frame {
            ConnectorFrame::Heartbeat { .. } => {
                debug!(tenant_id = %self.tenant_id, "connector heartbeat");
            }
            ConnectorFrame::Register(_) => {
                warn!(tenant_id = %self.tenant_id, "register frame after handshake, ignoring");
            }
            ConnectorFrame::ArrowChunk(chunk) => match STANDARD.decode(&chunk.arrow_chunk) {
                Ok(bytes) => self.push_chunk(&chunk.request_id, Bytes::from(bytes)),
                Err(e) => {
                    warn!(request_id = %chunk.request_id, "undecodable arrow chunk: {e}");
                }
            },
            ConnectorFrame::StreamStatus(status) => {
                if status.is_stream_end() {
                    // Close the sink before any pending-slot delivery
                    // for this id, so stream consumers never observe
                    // cleanup racing ahead of the end marker.
                    self.chunks.write().unwrap().remove(&status.request_id);
                }
                self.deliver_reply(ConnectorFrame::StreamStatus(status));
            }
            reply @ ConnectorFrame::FlightInfo(_) => self.deliver_reply(reply),
        }
    }

    /// Raw binary frames carry a request-id prefix; route by it,
    /// never broadcast.
    fn dispatch_binary(&self, data: Bytes) {
        let request_id = match messages::split_binary_chunk(&data) {
            Ok((id, _)) => id.to_string(),
            Err(e) => {
                warn!(tenant_id = %self.tenant_id, "dropping malformed binary frame: {e}");
                counter!("gateway_tunnel_bad_frames_total").increment(1);
                return;
            }
        };
        self.push_chunk(&request_id, data.slice(REQUEST_ID_LEN..));
    }

    fn push_chunk(&self, request_id: &str, payload: Bytes) {
        let sender = self.chunks.read().unwrap().get(request_id).cloned();
        let Some(sender) = sender else {
            debug!(request_id, "chunk for unknown stream, dropping");
            counter!("gateway_tunnel_orphan_chunks_total").increment(1);
            return;
        };

        match sender.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(request_id, "chunk sink full, dropping chunk");
                counter!("gateway_tunnel_chunks_dropped_total").increment(1);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.chunks.write().unwrap().remove(request_id);
            }
        }
    }

    /// One-shot delivery: the first reply for an id wins and consumes
    /// the slot; later replies for the same id are dropped.
    fn deliver_reply(&self, frame: ConnectorFrame) {
        let Some(request_id) = frame.request_id().map(str::to_string) else {
            return;
        };
        let slot = self.pending.write().unwrap().remove(&request_id);
        match slot {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    debug!(%request_id, "reply receiver gone");
                }
            }
            None => {
                debug!(%request_id, "late reply, dropping");
            }
        }
    }
}

/// Removes a pending slot on every exit path, including caller
/// cancellation.
struct PendingGuard<'a> {
    tunnel: &'a Tunnel,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.tunnel
            .pending
            .write()
            .unwrap()
            .remove(self.request_id);
    }
}

/// Consumer end of a chunk sink. Releases the sink on drop.
pub struct ChunkStream {
    tunnel: Arc<Tunnel>,
    request_id: String,
    rx: mpsc::Receiver<Bytes>,
}

impl ChunkStream {
    /// Next chunk, or `None` once the stream ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.tunnel
            .chunks
            .write()
            .unwrap()
            .remove(&self.request_id);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use common::messages::{ArrowChunk, FlightInfoReply, StreamStatus, StreamStatusBody};

    fn flight_info_cmd(request_id: &str) -> GatewayCommand {
        GatewayCommand::GetFlightInfo {
            request_id: request_id.to_string(),
            path: vec!["sales".to_string()],
            rows: None,
        }
    }

    fn do_get_cmd(request_id: &str) -> GatewayCommand {
        GatewayCommand::DoGet {
            request_id: request_id.to_string(),
            ticket: "dGVzdA==".to_string(),
        }
    }

    fn flight_info_reply(request_id: &str, partitions: u32) -> String {
        serde_json::to_string(&ConnectorFrame::FlightInfo(FlightInfoReply {
            request_id: request_id.to_string(),
            status: "ok".to_string(),
            dataset: None,
            partitions: Some(partitions),
            total_records: None,
            total_bytes: None,
            error: None,
        }))
        .unwrap()
    }

    fn stream_ack(request_id: &str) -> String {
        serde_json::to_string(&ConnectorFrame::StreamStatus(StreamStatus {
            request_id: request_id.to_string(),
            status: StreamStatusBody {
                kind: "stream_start".to_string(),
                partition: None,
                total_bytes: None,
                error: None,
            },
        }))
        .unwrap()
    }

    fn stream_end(request_id: &str) -> String {
        serde_json::to_string(&ConnectorFrame::StreamStatus(StreamStatus {
            request_id: request_id.to_string(),
            status: StreamStatusBody {
                kind: "stream_end".to_string(),
                partition: None,
                total_bytes: None,
                error: None,
            },
        }))
        .unwrap()
    }

    fn arrow_chunk(request_id: &str, payload: &[u8]) -> String {
        serde_json::to_string(&ConnectorFrame::ArrowChunk(ArrowChunk {
            request_id: request_id.to_string(),
            arrow_chunk: STANDARD.encode(payload),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_command_routes_reply_by_request_id() {
        let (tunnel, mut out_rx, in_tx) = mock_tunnel();

        let waiter = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.send_command(&flight_info_cmd("r1")).await })
        };

        // The connector sees the serialized command.
        let frame = out_rx.recv().await.unwrap();
        match frame {
            TunnelFrame::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "get_flight_info");
                assert_eq!(value["request_id"], "r1");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        in_tx
            .send(TunnelFrame::Text(flight_info_reply("r1", 4)))
            .unwrap();

        let reply = waiter.await.unwrap().unwrap();
        match reply {
            ConnectorFrame::FlightInfo(info) => assert_eq!(info.partition_count(), 4),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let (tunnel, _out_rx, _in_tx) = mock_tunnel();

        let pending = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.send_command(&flight_info_cmd("dup")).await })
        };
        tokio::task::yield_now().await;

        let second = tunnel.send_command(&flight_info_cmd("dup")).await;
        assert!(matches!(second, Err(GatewayError::DuplicateRequestId(_))));

        tunnel.shutdown();
        assert!(matches!(
            pending.await.unwrap(),
            Err(GatewayError::TunnelClosed)
        ));
    }

    #[tokio::test]
    async fn test_late_reply_dropped_without_effect() {
        let (tunnel, _out_rx, in_tx) = mock_tunnel();
        in_tx
            .send(TunnelFrame::Text(flight_info_reply("nobody-waiting", 1)))
            .unwrap();
        tokio::task::yield_now().await;
        assert!(tunnel.pending.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_streams_do_not_cross() {
        let (tunnel, mut out_rx, in_tx) = mock_tunnel();

        let open_a = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.open_stream(&do_get_cmd("stream-a")).await })
        };
        out_rx.recv().await.unwrap();
        in_tx.send(TunnelFrame::Text(stream_ack("stream-a"))).unwrap();
        let mut stream_a = open_a.await.unwrap().unwrap();

        let open_b = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.open_stream(&do_get_cmd("stream-b")).await })
        };
        out_rx.recv().await.unwrap();
        in_tx.send(TunnelFrame::Text(stream_ack("stream-b"))).unwrap();
        let mut stream_b = open_b.await.unwrap().unwrap();

        // Interleaved chunks must land on their own stream only.
        in_tx
            .send(TunnelFrame::Text(arrow_chunk("stream-a", b"a-first")))
            .unwrap();
        in_tx
            .send(TunnelFrame::Text(arrow_chunk("stream-b", b"b-first")))
            .unwrap();
        in_tx
            .send(TunnelFrame::Text(arrow_chunk("stream-a", b"a-second")))
            .unwrap();
        in_tx.send(TunnelFrame::Text(stream_end("stream-a"))).unwrap();
        in_tx.send(TunnelFrame::Text(stream_end("stream-b"))).unwrap();

        assert_eq!(stream_a.recv().await.unwrap(), Bytes::from_static(b"a-first"));
        assert_eq!(stream_a.recv().await.unwrap(), Bytes::from_static(b"a-second"));
        assert!(stream_a.recv().await.is_none());

        assert_eq!(stream_b.recv().await.unwrap(), Bytes::from_static(b"b-first"));
        assert!(stream_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_binary_frames_routed_by_prefix() {
        let (tunnel, mut out_rx, in_tx) = mock_tunnel();

        let request_id = "0192aab4-8d2e-7c30-b1a5-0c7d8e9f0a1b";
        let open = {
            let tunnel = Arc::clone(&tunnel);
            let cmd = do_get_cmd(request_id);
            tokio::spawn(async move { tunnel.open_stream(&cmd).await })
        };
        out_rx.recv().await.unwrap();
        in_tx.send(TunnelFrame::Text(stream_ack(request_id))).unwrap();
        let mut stream = open.await.unwrap().unwrap();

        let framed = messages::encode_binary_chunk(request_id, &[1, 2, 3]);
        in_tx.send(TunnelFrame::Binary(Bytes::from(framed))).unwrap();
        // A frame too short for a prefix is dropped, not broadcast.
        in_tx.send(TunnelFrame::Binary(Bytes::from_static(b"tiny"))).unwrap();
        in_tx.send(TunnelFrame::Text(stream_end(request_id))).unwrap();

        assert_eq!(stream.recv().await.unwrap(), Bytes::from_static(&[1, 2, 3]));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_sink_drops_new_chunks() {
        let (tunnel, mut out_rx, in_tx) = mock_tunnel();

        let open = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.open_stream(&do_get_cmd("slow")).await })
        };
        out_rx.recv().await.unwrap();
        in_tx.send(TunnelFrame::Text(stream_ack("slow"))).unwrap();
        let mut stream = open.await.unwrap().unwrap();

        // Overfill the sink without draining it.
        for i in 0..(CHUNK_SINK_CAPACITY + 3) {
            in_tx
                .send(TunnelFrame::Text(arrow_chunk("slow", format!("{i}").as_bytes())))
                .unwrap();
        }
        in_tx.send(TunnelFrame::Text(stream_end("slow"))).unwrap();

        // Let the acceptor work through the whole burst before
        // draining, so the sink bound is what limits delivery.
        while !tunnel.chunks.read().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let mut received = 0;
        while stream.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, CHUNK_SINK_CAPACITY);
    }

    #[tokio::test]
    async fn test_stream_end_wakes_pending_waiter() {
        let (tunnel, mut out_rx, in_tx) = mock_tunnel();

        // Empty partition: the only reply to do_get is stream_end.
        let open = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.open_stream(&do_get_cmd("empty")).await })
        };
        out_rx.recv().await.unwrap();
        in_tx.send(TunnelFrame::Text(stream_end("empty"))).unwrap();

        let mut stream = open.await.unwrap().unwrap();
        assert!(stream.recv().await.is_none());
        assert!(tunnel.chunks.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_fails_pending_and_closes_sinks() {
        let (tunnel, mut out_rx, in_tx) = mock_tunnel();

        let open = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.open_stream(&do_get_cmd("s1")).await })
        };
        out_rx.recv().await.unwrap();
        in_tx.send(TunnelFrame::Text(stream_ack("s1"))).unwrap();
        let mut stream = open.await.unwrap().unwrap();

        let waiter = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.send_command(&flight_info_cmd("r9")).await })
        };
        out_rx.recv().await.unwrap();

        // Connector drops the link.
        drop(in_tx);

        assert!(matches!(
            waiter.await.unwrap(),
            Err(GatewayError::TunnelClosed)
        ));
        assert!(stream.recv().await.is_none());
        assert!(tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_write_failure_shuts_tunnel_down() {
        let tunnel = Arc::new(Tunnel::new(
            TransportKind::WebSocket,
            "tenant-1",
            "connector-1",
            Box::new(BrokenSink),
        ));

        let result = tunnel.send_command(&flight_info_cmd("r1")).await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
        assert!(tunnel.is_closed());
        assert!(tunnel.pending.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_heartbeat_discarded() {
        let (tunnel, _out_rx, in_tx) = mock_tunnel();
        in_tx
            .send(TunnelFrame::Text(
                r#"{"type":"heartbeat","timestamp":1722600000}"#.to_string(),
            ))
            .unwrap();
        tokio::task::yield_now().await;
        assert!(tunnel.pending.read().unwrap().is_empty());
        assert!(tunnel.chunks.read().unwrap().is_empty());
        assert!(!tunnel.is_closed());
    }
}
