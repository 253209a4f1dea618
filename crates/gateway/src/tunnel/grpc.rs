//! gRPC bidirectional-stream transport for connector tunnels.
//!
//! Structured-only variant: every frame is a JSON envelope, and
//! record batches travel base64-encoded inside `arrow_chunk` frames.
//! Raw binary sends are rejected.

use super::ws::run_registered_tunnel;
use super::{TransportKind, TunnelFrame, TunnelSink, TunnelStream, REGISTRATION_TIMEOUT};
use crate::error::{GatewayError, Result};
use crate::stream::AppState;
use common::messages::{ConnectorFrame, GatewayCommand, RegisterRequest};
use metrics::counter;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

/// Generated protobuf and service code for the tunnel endpoint.
pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("gateway.tunnel.v1");
}

use proto::connector_tunnel_server::{ConnectorTunnel, ConnectorTunnelServer};
use proto::Envelope;

/// Outbound buffer between the tunnel writer and the gRPC stream.
const OUTBOUND_BUFFER: usize = 64;

/// The tunnel endpoint as a tonic service.
pub struct GrpcTunnelService {
    state: Arc<AppState>,
}

impl GrpcTunnelService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn into_server(self) -> ConnectorTunnelServer<Self> {
        ConnectorTunnelServer::new(self)
    }
}

/// Serve the tunnel endpoint on the given port.
pub async fn serve(state: Arc<AppState>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "gRPC tunnel endpoint listening");

    Server::builder()
        .add_service(GrpcTunnelService::new(state).into_server())
        .serve(addr)
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))
}

#[tonic::async_trait]
impl ConnectorTunnel for GrpcTunnelService {
    type ConnectStream =
        Pin<Box<dyn futures::Stream<Item = std::result::Result<Envelope, Status>> + Send>>;

    async fn connect(
        &self,
        request: Request<Streaming<Envelope>>,
    ) -> std::result::Result<Response<Self::ConnectStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        tokio::spawn(handshake_and_run(Arc::clone(&self.state), inbound, tx));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

async fn handshake_and_run(
    state: Arc<AppState>,
    inbound: Streaming<Envelope>,
    tx: mpsc::Sender<std::result::Result<Envelope, Status>>,
) {
    let mut stream = GrpcStream { inner: inbound };
    let mut sink = GrpcSink { tx };

    let registration =
        match tokio::time::timeout(REGISTRATION_TIMEOUT, read_register(&mut stream)).await {
            Ok(Ok(reg)) => reg,
            Ok(Err(reason)) => {
                reject(&mut sink, &reason).await;
                return;
            }
            Err(_) => {
                reject(&mut sink, "registration timeout").await;
                return;
            }
        };

    run_registered_tunnel(
        state,
        TransportKind::GrpcBidi,
        registration,
        Box::new(sink),
        Box::new(stream),
    )
    .await;
}

async fn read_register(stream: &mut GrpcStream) -> std::result::Result<RegisterRequest, String> {
    match stream.recv().await {
        Ok(Some(TunnelFrame::Text(text))) => match serde_json::from_str::<ConnectorFrame>(&text) {
            Ok(ConnectorFrame::Register(reg)) if !reg.tenant_id.is_empty() => Ok(reg),
            Ok(ConnectorFrame::Register(_)) => Err("missing tenant_id".to_string()),
            Ok(_) => Err("first frame must be register".to_string()),
            Err(_) => Err("invalid registration message".to_string()),
        },
        Ok(Some(TunnelFrame::Binary(_))) => Err("first frame must be register".to_string()),
        Ok(None) => Err("connection closed before registration".to_string()),
        Err(e) => Err(format!("read error: {e}")),
    }
}

async fn reject(sink: &mut GrpcSink, reason: &str) {
    warn!(reason, "connector registration rejected");
    counter!("gateway_connector_registration_failures_total").increment(1);
    let cmd = GatewayCommand::register_error(reason);
    if let Ok(json) = serde_json::to_string(&cmd) {
        let _ = sink.send(TunnelFrame::Text(json)).await;
    }
}

struct GrpcSink {
    tx: mpsc::Sender<std::result::Result<Envelope, Status>>,
}

#[async_trait::async_trait]
impl TunnelSink for GrpcSink {
    async fn send(&mut self, frame: TunnelFrame) -> Result<()> {
        let payload = match frame {
            TunnelFrame::Text(payload) => payload,
            TunnelFrame::Binary(_) => {
                return Err(GatewayError::UnsupportedFrame(
                    "binary frame on structured-only transport",
                ));
            }
        };
        self.tx
            .send(Ok(Envelope { payload }))
            .await
            .map_err(|_| GatewayError::ChannelSend)
    }
}

struct GrpcStream {
    inner: Streaming<Envelope>,
}

#[async_trait::async_trait]
impl TunnelStream for GrpcStream {
    async fn recv(&mut self) -> Result<Option<TunnelFrame>> {
        match self.inner.message().await {
            Ok(Some(envelope)) => Ok(Some(TunnelFrame::Text(envelope.payload))),
            Ok(None) => Ok(None),
            Err(status) => Err(GatewayError::Transport(status.to_string())),
        }
    }
}
