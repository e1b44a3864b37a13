// crates/pool/src/worker.rs
//! Query worker loop: one long-lived read-tuned storage client, driven by
//! framed messages on the parent channel.
//!
//! The worker answers exactly one READY (or ERROR) for the INIT message,
//! then serves QUERY / QUERY_BATCH until SHUTDOWN or parent disconnect.
//! Invalid requests inside a batch become per-request errors; a batch never
//! fails as a whole unless storage itself is unreachable.

use std::time::Instant;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use tally_core::error::QueryError;
use tally_store::Store;

use crate::protocol::{
    decode_frame, encode_frame, frame_reader, frame_writer, ParentMessage, ProtocolError,
    QueryMetrics, QueryRequest, QueryResult, WireCodec, WorkerMessage,
};

/// Connections held by one worker's private client.
const WORKER_POOL_SIZE: u32 = 4;

/// Drive the worker over an arbitrary byte channel (the binary wires this
/// to stdin/stdout; tests may use duplex pipes).
pub async fn run<R, W>(reader: R, writer: W) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = frame_reader(reader);
    let mut sink = frame_writer(writer);

    // First message must be INIT.
    let Some(first) = frames.next().await else {
        return Ok(());
    };
    let (message, codec) = decode_frame::<ParentMessage>(&first?)?;
    let ParentMessage::Init {
        connection_string,
        database_name,
        ..
    } = message
    else {
        let reply = WorkerMessage::Error {
            code: "protocol".into(),
            message: "first message must be INIT".into(),
            stack: None,
        };
        sink.send(encode_frame(codec, &reply)?).await?;
        return Ok(());
    };

    let store = match Store::open_read_only(&connection_string, WORKER_POOL_SIZE).await {
        Ok(store) => store,
        Err(e) => {
            let reply = WorkerMessage::Error {
                code: "initFailed".into(),
                message: e.to_string(),
                stack: None,
            };
            sink.send(encode_frame(codec, &reply)?).await?;
            return Ok(());
        }
    };
    sink.send(encode_frame(codec, &WorkerMessage::Ready)?).await?;
    info!(database = %database_name, "query worker connected");

    while let Some(frame) = frames.next().await {
        let bytes = frame?;
        let (mut message, frame_codec) = match decode_frame::<ParentMessage>(&bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "undecodable frame; skipping");
                continue;
            }
        };
        if frame_codec == WireCodec::Text {
            message.reinflate_timestamps();
        }

        match message {
            ParentMessage::Init { .. } => {
                warn!("duplicate INIT ignored");
            }
            ParentMessage::Query(request) => {
                let result = execute(&store, request).await;
                sink.send(encode_frame(codec, &WorkerMessage::Result(result))?)
                    .await?;
            }
            ParentMessage::QueryBatch { batch_id, requests } => {
                let results = futures_util::future::join_all(
                    requests.into_iter().map(|request| execute(&store, request)),
                )
                .await;
                let reply = WorkerMessage::ResultBatch { batch_id, results };
                sink.send(encode_frame(codec, &reply)?).await?;
            }
            ParentMessage::Shutdown => break,
        }
    }

    // SHUTDOWN or parent disconnect: in-flight work is already drained
    // because batches are executed inline above.
    info!("query worker draining and exiting");
    Ok(())
}

async fn execute(store: &Store, request: QueryRequest) -> QueryResult {
    let submit_time = Utc::now().timestamp_millis();
    let pipeline_bytes = serde_json::to_vec(&request.pipeline)
        .map(|b| b.len() as u64)
        .unwrap_or(0);
    let started = Instant::now();

    match store
        .run_pipeline(request.collection_name, &request.pipeline)
        .await
    {
        Ok(rows) => {
            let result_bytes = serde_json::to_vec(&rows).map(|b| b.len() as u64).unwrap_or(0);
            QueryResult {
                id: request.id,
                rows,
                error: None,
                metrics: QueryMetrics {
                    submit_time,
                    wait_time: 0,
                    exec_time: started.elapsed().as_millis() as u64,
                    pipeline_bytes,
                    result_bytes,
                },
            }
        }
        Err(e) => {
            let mut result = QueryResult::failed(request.id, QueryError::storage(e.to_string()));
            result.metrics = QueryMetrics {
                submit_time,
                wait_time: 0,
                exec_time: started.elapsed().as_millis() as u64,
                pipeline_bytes,
                result_bytes: 0,
            };
            result
        }
    }
}
