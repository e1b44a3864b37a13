// crates/pool/src/lib.rs
// Query dispatcher, worker-process pool, and the worker IPC protocol.
pub mod dispatcher;
pub mod manager;
pub mod protocol;
pub mod worker;

pub use dispatcher::{DispatcherTotals, ExecuteOutcome, ExecuteSummary, QueryDispatcher};
pub use manager::{Batch, BatchOutcome, WorkerInit, WorkerPool};
pub use protocol::{
    decode_frame, encode_frame, frame_reader, frame_writer, ParentMessage, ProtocolError,
    QueryMetrics, QueryOptions, QueryRequest, QueryResult, WireCodec, WorkerMessage,
};
