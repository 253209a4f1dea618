//! Browser-facing protocol message types.
//!
//! Defines the JSON message format on `/stream/{session_id}`. Text
//! frames carry these messages; binary frames carry opaque record
//! batches, one per frame.

use serde::{Deserialize, Serialize};

/// ZSTD frame magic, little-endian: `28 B5 2F FD`.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

// ============================================================================
// Client → Gateway Messages
// ============================================================================

/// Message sent from the browser to the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Start a stream for the given dataset, or the session's default.
    Query {
        #[serde(default)]
        dataset: Option<String>,
        /// Optional row cap, forwarded to the connector.
        #[serde(default)]
        rows: Option<i64>,
    },
    /// Keepalive; answered with `{status:"ok", message:"pong"}`.
    Ping,
}

/// Outcome of parsing a client text frame, separating malformed JSON
/// from well-formed messages with an unknown action.
pub fn parse_client_request(text: &str) -> std::result::Result<ClientRequest, String> {
    match serde_json::from_str::<ClientRequest>(text) {
        Ok(req) => Ok(req),
        Err(_) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => {
                let action = value
                    .get("action")
                    .and_then(|a| a.as_str())
                    .unwrap_or("<missing>");
                Err(format!("unknown action: {}", action))
            }
            Err(_) => Err("invalid JSON".to_string()),
        },
    }
}

// ============================================================================
// Gateway → Client Messages
// ============================================================================

/// Message sent from the gateway to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamResponse {
    /// Session validated; sent once after the upgrade.
    Authenticated {
        message: String,
        user_id: String,
        tenant_id: String,
        session_id: String,
    },
    /// Query accepted, dataset being loaded.
    Loading { message: String },
    /// Data transfer starting. `compression` tells the browser how to
    /// decode the binary frames that follow.
    Streaming {
        message: String,
        compression: &'static str,
    },
    /// Stream finished; totals cover every forwarded binary frame.
    Complete { total_bytes: u64, chunks: u64 },
    /// Recoverable per-message error; the session continues.
    Error { error: String },
    /// Session ended (revoked or expired).
    Disconnected { message: String },
    /// Generic acknowledgement (pong).
    Ok { message: String },
}

impl StreamResponse {
    pub fn error(error: impl Into<String>) -> Self {
        StreamResponse::Error {
            error: error.into(),
        }
    }

    pub fn pong() -> Self {
        StreamResponse::Ok {
            message: "pong".to_string(),
        }
    }
}

/// Compression label for a stream, from its first frame. The first
/// frame is the sole source of truth; the gateway never recompresses.
pub fn detect_compression(first_frame: &[u8]) -> &'static str {
    if first_frame.starts_with(&ZSTD_MAGIC) {
        "zstd"
    } else {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_with_defaults() {
        let req = parse_client_request(r#"{"action":"query"}"#).unwrap();
        match req {
            ClientRequest::Query { dataset, rows } => {
                assert!(dataset.is_none());
                assert!(rows.is_none());
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_query_with_dataset_and_rows() {
        let req = parse_client_request(r#"{"action":"query","dataset":"sales","rows":500}"#).unwrap();
        match req {
            ClientRequest::Query { dataset, rows } => {
                assert_eq!(dataset.as_deref(), Some("sales"));
                assert_eq!(rows, Some(500));
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_action() {
        let err = parse_client_request(r#"{"action":"subscribe"}"#).unwrap_err();
        assert_eq!(err, "unknown action: subscribe");
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = parse_client_request("{not json").unwrap_err();
        assert_eq!(err, "invalid JSON");
    }

    #[test]
    fn test_response_status_tags() {
        let json = serde_json::to_value(StreamResponse::pong()).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["message"], "pong");

        let json = serde_json::to_value(StreamResponse::Complete {
            total_bytes: 700,
            chunks: 3,
        })
        .unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["total_bytes"], 700);
        assert_eq!(json["chunks"], 3);

        let json = serde_json::to_value(StreamResponse::Streaming {
            message: "starting data transfer".to_string(),
            compression: "zstd",
        })
        .unwrap();
        assert_eq!(json["status"], "streaming");
        assert_eq!(json["compression"], "zstd");
    }

    #[test]
    fn test_detect_compression_zstd_magic() {
        assert_eq!(detect_compression(&[0x28, 0xB5, 0x2F, 0xFD, 0x00]), "zstd");
        assert_eq!(detect_compression(&[0x00, 0x01, 0x02, 0x03]), "none");
        assert_eq!(detect_compression(&[0x28, 0xB5]), "none");
        assert_eq!(detect_compression(&[]), "none");
    }
}
