//! WebSocket transport for connector tunnels.
//!
//! Connectors dial `/ws/connect` and must send a `register` frame
//! first. This variant carries raw binary chunk frames (request-id
//! prefixed) alongside the JSON envelopes.

use super::{TransportKind, Tunnel, TunnelFrame, TunnelSink, TunnelStream, REGISTRATION_TIMEOUT};
use crate::error::Result;
use crate::stream::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use common::messages::{ConnectorFrame, GatewayCommand, RegisterRequest};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::sync::Arc;
use tracing::{info, warn};

/// Upgrade handler for `/ws/connect`.
pub async fn connector_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connector_socket(socket, state))
}

async fn handle_connector_socket(socket: WebSocket, state: Arc<AppState>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let mut sink = WsSink { tx: ws_tx };

    let registration =
        match tokio::time::timeout(REGISTRATION_TIMEOUT, read_register(&mut ws_rx)).await {
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
        TransportKind::WebSocket,
        registration,
        Box::new(sink),
        Box::new(WsStream { rx: ws_rx }),
    )
    .await;
}

/// Shared tail of the registration handshake: both transport variants
/// construct the tunnel, bind it to the registry, confirm, and run
/// the inbound loop until the connection dies.
pub(super) async fn run_registered_tunnel(
    state: Arc<AppState>,
    kind: TransportKind,
    registration: RegisterRequest,
    sink: Box<dyn TunnelSink>,
    stream: Box<dyn TunnelStream>,
) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let connector_id = registration
        .connector_id
        .clone()
        .unwrap_or_else(|| session_id.clone());

    let tunnel = Arc::new(Tunnel::new(kind, &registration.tenant_id, &connector_id, sink));
    let tunnel_id = tunnel.id().to_string();
    state
        .registry
        .register(Arc::clone(&tunnel), registration.address.clone());

    if tunnel
        .send_control(&GatewayCommand::register_ok(session_id.clone()))
        .await
        .is_err()
    {
        state.registry.unregister(&registration.tenant_id, &tunnel_id);
        return;
    }

    counter!("gateway_connector_registrations_total").increment(1);
    info!(
        tenant_id = %registration.tenant_id,
        %connector_id,
        %session_id,
        transport = %kind,
        version = %registration.version,
        datasets = ?registration.datasets,
        "connector registered"
    );

    Arc::clone(&tunnel).run(stream).await;

    state.registry.unregister(&registration.tenant_id, &tunnel_id);
}

async fn read_register(rx: &mut SplitStream<WebSocket>) -> std::result::Result<RegisterRequest, String> {
    while let Some(msg) = rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str::<ConnectorFrame>(&text) {
                    Ok(ConnectorFrame::Register(reg)) if !reg.tenant_id.is_empty() => Ok(reg),
                    Ok(ConnectorFrame::Register(_)) => Err("missing tenant_id".to_string()),
                    Ok(_) => Err("first frame must be register".to_string()),
                    Err(_) => Err("invalid registration message".to_string()),
                };
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(_) => return Err("first frame must be register".to_string()),
            Err(e) => return Err(format!("read error: {e}")),
        }
    }
    Err("connection closed before registration".to_string())
}

async fn reject(sink: &mut WsSink, reason: &str) {
    warn!(reason, "connector registration rejected");
    counter!("gateway_connector_registration_failures_total").increment(1);
    let cmd = GatewayCommand::register_error(reason);
    if let Ok(json) = serde_json::to_string(&cmd) {
        let _ = sink.send(TunnelFrame::Text(json)).await;
    }
}

struct WsSink {
    tx: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl TunnelSink for WsSink {
    async fn send(&mut self, frame: TunnelFrame) -> Result<()> {
        let msg = match frame {
            TunnelFrame::Text(text) => Message::Text(text.into()),
            TunnelFrame::Binary(data) => Message::Binary(data),
        };
        self.tx.send(msg).await.map_err(Into::into)
    }
}

struct WsStream {
    rx: SplitStream<WebSocket>,
}

#[async_trait::async_trait]
impl TunnelStream for WsStream {
    async fn recv(&mut self) -> Result<Option<TunnelFrame>> {
        while let Some(msg) = self.rx.next().await {
            match msg {
                Ok(Message::Text(text)) => return Ok(Some(TunnelFrame::Text(text.to_string()))),
                Ok(Message::Binary(data)) => return Ok(Some(TunnelFrame::Binary(data))),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}
