//! Ticket encoding for `do_get` requests.
//!
//! A ticket is base64 of a small JSON object naming the slice of data
//! to stream. The gateway emits standard padded base64; connectors in
//! the wild have emitted both standard and URL-safe variants, so
//! decoding accepts all four combinations.

use crate::error::{Error, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Names a subset of a dataset for a single `do_get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub dataset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_partitions: Option<u32>,
    /// Row cap requested by the client, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<i64>,
}

impl Ticket {
    /// Ticket for one partition of a parallel fetch.
    pub fn for_partition(
        dataset: &str,
        partition: u32,
        total_partitions: u32,
        rows: Option<i64>,
    ) -> Self {
        Self {
            tenant_id: None,
            dataset: dataset.to_string(),
            partition: Some(partition),
            total_partitions: Some(total_partitions),
            rows,
        }
    }

    /// Encode as standard padded base64 of the JSON form.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("ticket serialization cannot fail");
        STANDARD.encode(json)
    }

    /// Decode from any common base64 dialect.
    pub fn decode(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let bytes = decode_any_base64(raw)?;
        let ticket: Ticket = serde_json::from_slice(&bytes)?;
        if ticket.dataset.is_empty() {
            return Err(Error::InvalidTicket("empty dataset".to_string()));
        }
        Ok(ticket)
    }
}

fn decode_any_base64(raw: &str) -> Result<Vec<u8>> {
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        if let Ok(bytes) = engine.decode(raw) {
            return Ok(bytes);
        }
    }
    Err(Error::InvalidTicket("unrecognized base64".to_string()))
}
