//! Query pipeline: one `get_flight_info`, then one `do_get` per
//! partition in parallel, all chunks fanned into a single output
//! channel.
//!
//! No ordering is promised across partitions; within a partition,
//! chunk order is preserved from connector emission to the output
//! channel.

use crate::error::{GatewayError, Result};
use crate::tunnel::Tunnel;
use bytes::Bytes;
use common::messages::{ConnectorFrame, GatewayCommand};
use common::Ticket;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Deadline over the whole flight_info + do_get sequence.
const QUERY_DEADLINE: Duration = Duration::from_secs(120);

/// Stream `dataset` from the connector into `out`. The channel closes
/// when every partition task has finished (or the deadline aborts
/// them).
pub async fn fetch_dataset(
    tunnel: Arc<Tunnel>,
    dataset: &str,
    rows: Option<i64>,
    out: mpsc::Sender<Bytes>,
) -> Result<()> {
    match tokio::time::timeout(QUERY_DEADLINE, fetch_inner(tunnel, dataset, rows, out)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(dataset, "query deadline exceeded");
            counter!("gateway_query_timeouts_total").increment(1);
            Err(GatewayError::QueryTimeout)
        }
    }
}

async fn fetch_inner(
    tunnel: Arc<Tunnel>,
    dataset: &str,
    rows: Option<i64>,
    out: mpsc::Sender<Bytes>,
) -> Result<()> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let reply = tunnel
        .send_command(&GatewayCommand::GetFlightInfo {
            request_id,
            path: vec![dataset.to_string()],
            rows,
        })
        .await?;

    let info = match reply {
        ConnectorFrame::FlightInfo(info) if info.is_error() => {
            let reason = info.error.unwrap_or_else(|| "get_flight_info failed".to_string());
            return Err(GatewayError::Connector(reason));
        }
        ConnectorFrame::FlightInfo(info) => info,
        ConnectorFrame::StreamStatus(status) => {
            let reason = status
                .status
                .error
                .unwrap_or_else(|| "get_flight_info failed".to_string());
            return Err(GatewayError::Connector(reason));
        }
        other => {
            return Err(GatewayError::Connector(format!(
                "unexpected reply to get_flight_info: {:?}",
                other
            )));
        }
    };

    let partitions = info.partition_count();
    info!(dataset, partitions, "starting parallel partition fetch");

    let mut tasks = JoinSet::new();
    for partition in 0..partitions {
        tasks.spawn(fetch_partition(
            Arc::clone(&tunnel),
            dataset.to_string(),
            partition,
            partitions,
            rows,
            out.clone(),
        ));
    }
    // Partition tasks hold the only remaining senders; the channel
    // closes when the last of them finishes.
    drop(out);

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(dataset, "partition error: {e}");
                counter!("gateway_partition_errors_total").increment(1);
                first_error.get_or_insert(e);
            }
            Err(e) => {
                warn!(dataset, "partition task failed: {e}");
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            debug!(dataset, partitions, "all partitions complete");
            Ok(())
        }
    }
}

async fn fetch_partition(
    tunnel: Arc<Tunnel>,
    dataset: String,
    partition: u32,
    total_partitions: u32,
    rows: Option<i64>,
    out: mpsc::Sender<Bytes>,
) -> Result<()> {
    let ticket = Ticket::for_partition(&dataset, partition, total_partitions, rows).encode();
    let request_id = uuid::Uuid::new_v4().to_string();
    debug!(%dataset, partition, total_partitions, "do_get");

    let mut stream = tunnel
        .open_stream(&GatewayCommand::DoGet { request_id, ticket })
        .await?;

    while let Some(chunk) = stream.recv().await {
        if out.send(chunk).await.is_err() {
            // Consumer gone (client closed or abandoned); stop draining.
            debug!(%dataset, partition, "output channel closed, abandoning partition");
            return Ok(());
        }
    }

    debug!(%dataset, partition, "partition complete");
    Ok(())
}
