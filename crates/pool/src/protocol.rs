// crates/pool/src/protocol.rs
//! Worker IPC protocol: message variants, the two wire codecs, and the
//! length-delimited framing helpers.
//!
//! Frames carry either the plain JSON message (text codec) or the
//! `{"__binary": true, "__payload": "<base64>"}` envelope wrapping the
//! bincode encoding (binary codec). The receiver auto-detects which one it
//! got. Under the text codec timestamp values degrade to RFC-3339 strings;
//! [`ParentMessage::reinflate_timestamps`] / [`WorkerMessage::reinflate_timestamps`]
//! restore them on receipt.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use tally_core::error::QueryError;
use tally_core::pipeline::{reinflate_stage_timestamps, Collection, Stage};
use tally_core::value::Value;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary codec error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("bad binary envelope: {0}")]
    Envelope(String),

    #[error("IO error on worker channel: {0}")]
    Io(#[from] std::io::Error),
}

/// Which wire encoding to emit. Decoding accepts either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireCodec {
    Text,
    Binary,
}

/// One aggregation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Assigned by the dispatcher when the caller left it empty.
    #[serde(default)]
    pub id: String,
    pub pipeline: Vec<Stage>,
    pub collection_name: Collection,
    #[serde(default)]
    pub options: Option<QueryOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    /// Opaque comment attributed to the query in storage diagnostics.
    pub comment: Option<String>,
}

/// Per-request timing and sizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryMetrics {
    /// Epoch ms when the executing side received the request.
    pub submit_time: i64,
    /// Time spent waiting for a worker/slot, ms.
    pub wait_time: u64,
    /// Pipeline execution time, ms.
    pub exec_time: u64,
    pub pipeline_bytes: u64,
    pub result_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub id: String,
    pub rows: Vec<Value>,
    #[serde(default)]
    pub error: Option<QueryError>,
    #[serde(default)]
    pub metrics: QueryMetrics,
}

impl QueryResult {
    pub fn failed(id: impl Into<String>, error: QueryError) -> Self {
        Self {
            id: id.into(),
            rows: Vec::new(),
            error: Some(error),
            metrics: QueryMetrics::default(),
        }
    }
}

/// Messages from the pool manager to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ParentMessage {
    Init {
        connection_string: String,
        database_name: String,
        #[serde(default)]
        database_options: Option<Value>,
    },
    Query(QueryRequest),
    QueryBatch {
        batch_id: String,
        requests: Vec<QueryRequest>,
    },
    Shutdown,
}

/// Messages from a worker back to the pool manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    Ready,
    Error {
        code: String,
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
    Result(QueryResult),
    ResultBatch {
        batch_id: String,
        results: Vec<QueryResult>,
    },
}

impl ParentMessage {
    /// Restore timestamps after a text-codec round trip.
    pub fn reinflate_timestamps(&mut self) {
        match self {
            ParentMessage::Query(request) => reinflate_stage_timestamps(&mut request.pipeline),
            ParentMessage::QueryBatch { requests, .. } => {
                for request in requests {
                    reinflate_stage_timestamps(&mut request.pipeline);
                }
            }
            ParentMessage::Init { .. } | ParentMessage::Shutdown => {}
        }
    }
}

impl WorkerMessage {
    pub fn reinflate_timestamps(&mut self) {
        let reinflate_result = |result: &mut QueryResult| {
            for row in &mut result.rows {
                row.reinflate_timestamps();
            }
        };
        match self {
            WorkerMessage::Result(result) => reinflate_result(result),
            WorkerMessage::ResultBatch { results, .. } => {
                results.iter_mut().for_each(reinflate_result)
            }
            WorkerMessage::Ready | WorkerMessage::Error { .. } => {}
        }
    }
}

#[derive(Serialize, Deserialize)]
struct BinaryEnvelope {
    #[serde(rename = "__binary")]
    binary: bool,
    #[serde(rename = "__payload")]
    payload: String,
}

/// Encode one frame body.
pub fn encode_frame<T: Serialize>(codec: WireCodec, message: &T) -> Result<Bytes, ProtocolError> {
    let bytes = match codec {
        WireCodec::Text => serde_json::to_vec(message)?,
        WireCodec::Binary => {
            let payload = bincode::serialize(message)?;
            serde_json::to_vec(&BinaryEnvelope {
                binary: true,
                payload: BASE64.encode(payload),
            })?
        }
    };
    Ok(Bytes::from(bytes))
}

/// Decode one frame body, detecting the codec from the envelope. Returns
/// the message and the codec it arrived in (the receiver reinflates
/// timestamps only for text frames).
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, WireCodec), ProtocolError> {
    let raw: serde_json::Value = serde_json::from_slice(bytes)?;
    if raw
        .get("__binary")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        let payload = raw
            .get("__payload")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProtocolError::Envelope("missing __payload".into()))?;
        let decoded = BASE64
            .decode(payload)
            .map_err(|e| ProtocolError::Envelope(e.to_string()))?;
        Ok((bincode::deserialize(&decoded)?, WireCodec::Binary))
    } else {
        Ok((serde_json::from_value(raw)?, WireCodec::Text))
    }
}

/// Upper bound for one frame. Aggregation replies can carry large
/// collected sets, so this sits well above the codec default.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Length-delimited frame transports over any byte stream.
pub fn frame_reader<R: tokio::io::AsyncRead>(inner: R) -> FramedRead<R, LengthDelimitedCodec> {
    FramedRead::new(inner, frame_codec())
}

pub fn frame_writer<W: tokio::io::AsyncWrite>(inner: W) -> FramedWrite<W, LengthDelimitedCodec> {
    FramedWrite::new(inner, frame_codec())
}
