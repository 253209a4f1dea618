//! Client streaming endpoint.
//!
//! Browsers connect to `/stream/{session_id}`. The session is
//! validated against the control plane before the upgrade; after it,
//! the handler answers `query` and `ping` actions and forwards record
//! batches as binary frames. The session's close signal preempts
//! everything: once it fires, no further binary frame is written.

use crate::error::GatewayError;
use crate::protocol::{detect_compression, parse_client_request, ClientRequest, StreamResponse};
use crate::registry::ConnectorRegistry;
use crate::session::{Session, SessionManager};
use crate::tunnel::CHUNK_SINK_CAPACITY;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Keepalive cadence towards the browser.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state.
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub registry: Arc<ConnectorRegistry>,
}

/// Create the HTTP router: client streaming, connector tunnels, and
/// the health surface.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream/{session_id}", get(stream_handler))
        .route("/ws/connect", get(crate::tunnel::ws::connector_ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (sessions, users) = state.sessions.stats();
    let connectors = state.registry.connected_count();
    format!(
        r#"{{"status":"ok","sessions":{},"users":{},"connectors":{}}}"#,
        sessions, users, connectors
    )
}

/// Validate the session, check the tenant, then upgrade.
async fn stream_handler(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match state.sessions.get_or_create(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            info!(%session_id, "rejected invalid or expired session");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "session not found or expired"})),
            )
                .into_response();
        }
        Err(e) => {
            warn!(%session_id, "session validation failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "session validation failed"})),
            )
                .into_response();
        }
    };

    if !state.registry.is_connected(&session.tenant_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("tenant not connected: {}", session.tenant_id)})),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_stream_socket(socket, state, session))
}

/// Handle one upgraded client connection.
async fn handle_stream_socket(socket: WebSocket, state: Arc<AppState>, session: Arc<Session>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // All writes to the socket funnel through this channel into one
    // writer task.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    session.bind_browser(tx.clone());
    counter!("gateway_client_connections_total").increment(1);
    gauge!("gateway_connected_clients").increment(1.0);
    info!(
        session_id = %session.id,
        user_id = %session.user_id,
        tenant_id = %session.tenant_id,
        "browser connected"
    );

    let _ = send_json(
        &tx,
        &StreamResponse::Authenticated {
            message: "session validated successfully".to_string(),
            user_id: session.user_id.clone(),
            tenant_id: session.tenant_id.clone(),
            session_id: session.id.clone(),
        },
    );

    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.reset();

    loop {
        tokio::select! {
            biased;

            _ = session.closed() => {
                let _ = send_json(&tx, &StreamResponse::Disconnected {
                    message: "session revoked".to_string(),
                });
                break;
            }

            _ = ping.tick() => {
                if tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => match msg {
                Some(Ok(msg)) => {
                    if session.is_expired() {
                        let _ = send_json(&tx, &StreamResponse::Disconnected {
                            message: "session expired".to_string(),
                        });
                        state.sessions.revoke(&session.id);
                        break;
                    }
                    handle_client_message(&state, &session, &tx, msg);
                }
                Some(Err(e)) => {
                    // Normal closes surface as None; anything here is
                    // worth a log line.
                    warn!(session_id = %session.id, "client read error: {e}");
                    break;
                }
                None => break,
            }
        }
    }

    send_task.abort();
    gauge!("gateway_connected_clients").decrement(1.0);
    info!(session_id = %session.id, "browser disconnected");
}

fn handle_client_message(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    tx: &mpsc::UnboundedSender<Message>,
    msg: Message,
) {
    match msg {
        Message::Text(text) => match parse_client_request(&text) {
            Ok(ClientRequest::Query { dataset, rows }) => {
                let dataset = dataset
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| session.dataset.clone());
                if dataset.is_empty() {
                    let _ = send_json(tx, &StreamResponse::error("no dataset specified"));
                    return;
                }
                counter!("gateway_queries_total").increment(1);
                tokio::spawn(run_query(
                    Arc::clone(&state.registry),
                    Arc::clone(session),
                    tx.clone(),
                    dataset,
                    rows,
                ));
            }
            Ok(ClientRequest::Ping) => {
                let _ = send_json(tx, &StreamResponse::pong());
            }
            Err(reason) => {
                let _ = send_json(tx, &StreamResponse::error(reason));
            }
        },
        Message::Binary(_) => {
            let _ = send_json(tx, &StreamResponse::error("binary frames not accepted"));
        }
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => {}
    }
}

/// Drive one query: kick off the pipeline, sniff compression from the
/// first chunk, forward binary frames, and report totals. Abandons
/// immediately when the session's close signal fires.
async fn run_query(
    registry: Arc<ConnectorRegistry>,
    session: Arc<Session>,
    tx: mpsc::UnboundedSender<Message>,
    dataset: String,
    rows: Option<i64>,
) {
    let _ = send_json(
        &tx,
        &StreamResponse::Loading {
            message: format!("loading dataset: {dataset}"),
        },
    );

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(CHUNK_SINK_CAPACITY);
    let query_task = {
        let registry = Arc::clone(&registry);
        let tenant_id = session.tenant_id.clone();
        let dataset = dataset.clone();
        tokio::spawn(async move { registry.query(&tenant_id, &dataset, rows, chunk_tx).await })
    };

    info!(
        session_id = %session.id,
        tenant_id = %session.tenant_id,
        %dataset,
        "query started"
    );

    let mut total_bytes: u64 = 0;
    let mut chunks: u64 = 0;
    let mut first_chunk = true;

    loop {
        tokio::select! {
            biased;

            _ = session.closed() => {
                info!(session_id = %session.id, "session closed mid-stream, abandoning query");
                query_task.abort();
                return;
            }

            chunk = chunk_rx.recv() => match chunk {
                Some(chunk) => {
                    if first_chunk {
                        let compression = detect_compression(&chunk);
                        let _ = send_json(&tx, &StreamResponse::Streaming {
                            message: "starting data transfer".to_string(),
                            compression,
                        });
                        debug!(compression, "compression auto-detected");
                        first_chunk = false;
                    }

                    total_bytes += chunk.len() as u64;
                    chunks += 1;
                    if tx.send(Message::Binary(chunk)).is_err() {
                        query_task.abort();
                        return;
                    }
                }
                None => break,
            }
        }
    }

    match query_task.await {
        Ok(Ok(())) => {}
        Ok(Err(GatewayError::TenantNotConnected(tenant_id))) => {
            let _ = send_json(
                &tx,
                &StreamResponse::error(format!("tenant not connected: {tenant_id}")),
            );
            return;
        }
        Ok(Err(e)) => {
            // Best effort: the client still gets totals for whatever
            // arrived before the failure.
            warn!(session_id = %session.id, %dataset, "query error: {e}");
        }
        Err(e) => {
            warn!(session_id = %session.id, %dataset, "query task failed: {e}");
        }
    }

    counter!("gateway_chunks_forwarded_total").increment(chunks);
    counter!("gateway_bytes_forwarded_total").increment(total_bytes);
    let _ = send_json(&tx, &StreamResponse::Complete { total_bytes, chunks });
    info!(
        session_id = %session.id,
        %dataset,
        total_bytes,
        chunks,
        "query complete"
    );
}

fn send_json(
    tx: &mpsc::UnboundedSender<Message>,
    resp: &StreamResponse,
) -> Result<(), GatewayError> {
    let json = serde_json::to_string(resp)?;
    tx.send(Message::Text(json.into()))
        .map_err(|_| GatewayError::ChannelSend)
}
