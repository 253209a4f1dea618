//! Tunnel wire protocol between the gateway and data connectors.
//!
//! Both transport variants (WebSocket and gRPC bidirectional stream)
//! exchange the same JSON envelopes. Inbound frames carry a `type`
//! discriminator and a `request_id` correlating them to a prior
//! outbound command.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Length of the request-id prefix on raw binary chunk frames
/// (a v4 UUID in text form).
pub const REQUEST_ID_LEN: usize = 36;

/// Inner discriminator of a `stream_status` frame that terminates a
/// chunk stream.
pub const STREAM_END: &str = "stream_end";

// ============================================================================
// Connector → Gateway Frames
// ============================================================================

/// Frame sent from a connector to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorFrame {
    /// Registration handshake. Must be the first frame on a tunnel.
    Register(RegisterRequest),
    /// Reply to a `get_flight_info` command.
    FlightInfo(FlightInfoReply),
    /// One record batch, base64-encoded. Used when the transport
    /// carries structured messages only.
    ArrowChunk(ArrowChunk),
    /// Stream lifecycle event for a `do_get` request.
    StreamStatus(StreamStatus),
    /// Keepalive. Discarded by the gateway.
    Heartbeat {
        #[serde(default)]
        timestamp: i64,
    },
}

impl ConnectorFrame {
    /// The request id this frame correlates to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ConnectorFrame::Register(_) | ConnectorFrame::Heartbeat { .. } => None,
            ConnectorFrame::FlightInfo(r) => Some(&r.request_id),
            ConnectorFrame::ArrowChunk(c) => Some(&c.request_id),
            ConnectorFrame::StreamStatus(s) => Some(&s.request_id),
        }
    }
}

/// Registration payload from a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Tenant this connector serves.
    pub tenant_id: String,
    /// Identity of this connector instance. Optional for older
    /// connectors; tenants map to at most one live tunnel either way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,
    #[serde(default)]
    pub version: String,
    /// Datasets this connector exposes.
    #[serde(default)]
    pub datasets: Vec<String>,
    /// Advertised address, if the connector is also reachable
    /// directly. Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Reply to `get_flight_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightInfoReply {
    pub request_id: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    /// Number of independently-streamable partitions. Absent means 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_records: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_status() -> String {
    "ok".to_string()
}

impl FlightInfoReply {
    pub fn is_error(&self) -> bool {
        self.status == "error" || self.error.is_some()
    }

    /// Partition count, clamped to at least one.
    pub fn partition_count(&self) -> u32 {
        self.partitions.unwrap_or(1).max(1)
    }
}

/// Base64-encoded record batch inside a structured frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrowChunk {
    pub request_id: String,
    pub arrow_chunk: String,
}

/// Stream lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatus {
    pub request_id: String,
    pub status: StreamStatusBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatusBody {
    /// Event kind, e.g. `stream_end`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamStatus {
    pub fn is_stream_end(&self) -> bool {
        self.status.kind == STREAM_END
    }
}

// ============================================================================
// Gateway → Connector Commands
// ============================================================================

/// Command sent from the gateway to a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Outcome of the registration handshake.
    RegisterResponse {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Ask for dataset metadata (partition count).
    GetFlightInfo {
        request_id: String,
        path: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<i64>,
    },
    /// Start streaming the slice of data named by the ticket.
    DoGet { request_id: String, ticket: String },
    /// Keepalive.
    Heartbeat { timestamp: i64 },
}

impl GatewayCommand {
    /// The request id callers must correlate replies with, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            GatewayCommand::GetFlightInfo { request_id, .. }
            | GatewayCommand::DoGet { request_id, .. } => Some(request_id),
            GatewayCommand::RegisterResponse { .. } | GatewayCommand::Heartbeat { .. } => None,
        }
    }

    pub fn register_ok(session_id: String) -> Self {
        GatewayCommand::RegisterResponse {
            status: "ok".to_string(),
            session_id: Some(session_id),
            error: None,
        }
    }

    pub fn register_error(error: impl Into<String>) -> Self {
        GatewayCommand::RegisterResponse {
            status: "error".to_string(),
            session_id: None,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// Raw Binary Chunk Framing (WebSocket variant)
// ============================================================================

/// Split a raw binary chunk frame into its request-id prefix and
/// payload. Frames shorter than the prefix, or with a non-UTF-8
/// prefix, are rejected.
pub fn split_binary_chunk(data: &[u8]) -> Result<(&str, &[u8])> {
    if data.len() < REQUEST_ID_LEN {
        return Err(Error::InvalidFrame(format!(
            "binary frame too short for request-id prefix: {} bytes",
            data.len()
        )));
    }
    let (prefix, payload) = data.split_at(REQUEST_ID_LEN);
    let request_id = std::str::from_utf8(prefix)
        .map_err(|_| Error::InvalidFrame("non-UTF-8 request-id prefix".to_string()))?;
    Ok((request_id, payload))
}

/// Prefix chunk bytes with their request id for a raw binary frame.
pub fn encode_binary_chunk(request_id: &str, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(REQUEST_ID_LEN + payload.len());
    framed.extend_from_slice(request_id.as_bytes());
    framed.extend_from_slice(payload);
    framed
}
