// crates/pool/src/manager.rs
//! Process pool manager: spawns, initializes, health-watches and shuts
//! down query worker processes.
//!
//! All pool state (worker slots, the pending-batch table, the admission
//! queue) is owned by a single task; handles talk to it over an mpsc
//! command channel, and completions are signalled by settling one-shot
//! reply slots. Reader tasks and timers feed the same channel, so every
//! mutation is serial.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tally_core::config::PoolSettings;
use tally_core::error::{EngineError, EngineResult, QueryError, QueryErrorKind};
use tally_core::value::Value;

use crate::protocol::{
    decode_frame, encode_frame, frame_reader, frame_writer, ParentMessage, QueryRequest,
    QueryResult, WireCodec, WorkerMessage,
};

/// Consecutive respawn attempts before a slot is left dead.
const MAX_RESPAWNS: u32 = 3;

/// INIT payload for each worker.
#[derive(Debug, Clone)]
pub struct WorkerInit {
    pub connection_string: String,
    pub database_name: String,
    pub database_options: Option<Value>,
}

/// A list of requests handed to one worker as a single IPC message.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub requests: Vec<QueryRequest>,
}

impl Batch {
    pub fn new(requests: Vec<QueryRequest>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            requests,
        }
    }
}

/// Batch-level outcome; per-request errors live inside the results.
pub type BatchOutcome = Result<Vec<QueryResult>, QueryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Spawning,
    Ready,
    Busy,
    Dead,
}

struct WorkerSlot {
    state: WorkerState,
    generation: u64,
    child: Option<Child>,
    pid: Option<u32>,
    writer: Option<FramedWrite<ChildStdin, LengthDelimitedCodec>>,
    current_batch: Option<String>,
    respawns: u32,
}

impl WorkerSlot {
    fn empty() -> Self {
        Self {
            state: WorkerState::Dead,
            generation: 0,
            child: None,
            pid: None,
            writer: None,
            current_batch: None,
            respawns: 0,
        }
    }
}

struct PendingBatch {
    worker: usize,
    reply: oneshot::Sender<BatchOutcome>,
    queued_for: Duration,
    dispatched_at: Instant,
}

struct QueuedBatch {
    batch: Batch,
    timeout: Duration,
    reply: oneshot::Sender<BatchOutcome>,
    queued_at: Instant,
}

enum PoolCommand {
    Submit {
        batch: Batch,
        timeout: Duration,
        max_wait: Duration,
        reply: oneshot::Sender<BatchOutcome>,
    },
    FromWorker {
        worker: usize,
        generation: u64,
        message: WorkerMessage,
    },
    WorkerExited {
        worker: usize,
        generation: u64,
    },
    InitTimedOut {
        worker: usize,
        generation: u64,
    },
    BatchTimedOut {
        batch_id: String,
    },
    AdmissionTimedOut {
        batch_id: String,
    },
    KillWorker {
        worker: usize,
        reply: oneshot::Sender<bool>,
    },
    WorkerPids {
        reply: oneshot::Sender<Vec<Option<u32>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the pool task. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    cmd_tx: mpsc::Sender<PoolCommand>,
    ready_rx: watch::Receiver<usize>,
    worker_count: u32,
}

impl WorkerPool {
    /// Spawn `worker_count` subordinate processes eagerly and start the
    /// pool task. Fails fatally when the pool cannot be created at all.
    pub fn spawn(settings: &PoolSettings, init: WorkerInit) -> EngineResult<WorkerPool> {
        if settings.worker_count == 0 {
            return Err(EngineError::Fatal("worker pool is disabled (workerCount = 0)".into()));
        }
        let worker_command = match &settings.worker_command {
            Some(path) => path.clone(),
            None => default_worker_command()?,
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (ready_tx, ready_rx) = watch::channel(0usize);

        let task = PoolTask {
            codec: if settings.binary_codec {
                WireCodec::Binary
            } else {
                WireCodec::Text
            },
            init_timeout: Duration::from_millis(settings.worker_init_timeout_ms),
            init,
            worker_command,
            workers: (0..settings.worker_count).map(|_| WorkerSlot::empty()).collect(),
            pending: HashMap::new(),
            queue: VecDeque::new(),
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            ready_tx,
            shutting_down: false,
        };
        tokio::spawn(task.run());

        Ok(WorkerPool {
            cmd_tx,
            ready_rx,
            worker_count: settings.worker_count,
        })
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    /// Resolve once at least one worker has answered READY.
    pub async fn wait_ready(&self) -> EngineResult<()> {
        let mut rx = self.ready_rx.clone();
        while *rx.borrow() == 0 {
            rx.changed()
                .await
                .map_err(|_| EngineError::Fatal("worker pool task terminated".into()))?;
        }
        Ok(())
    }

    /// Submit the batches concurrently; each resolves to its own outcome.
    /// Batches with a free worker dispatch immediately, the rest wait up to
    /// `max_wait_ms` for one.
    pub async fn execute_batches(
        &self,
        batches: Vec<Batch>,
        timeout_ms: u64,
        max_wait_ms: u64,
    ) -> Vec<BatchOutcome> {
        let mut replies = Vec::with_capacity(batches.len());
        for batch in batches {
            let (tx, rx) = oneshot::channel();
            let submitted = self
                .cmd_tx
                .send(PoolCommand::Submit {
                    batch,
                    timeout: Duration::from_millis(timeout_ms),
                    max_wait: Duration::from_millis(max_wait_ms),
                    reply: tx,
                })
                .await
                .is_ok();
            replies.push((rx, submitted));
        }

        let mut outcomes = Vec::with_capacity(replies.len());
        for (rx, submitted) in replies {
            let outcome = if !submitted {
                Err(QueryError::new(
                    QueryErrorKind::WorkerDied,
                    "worker pool is unavailable",
                ))
            } else {
                rx.await.unwrap_or_else(|_| {
                    Err(QueryError::new(
                        QueryErrorKind::WorkerDied,
                        "worker pool dropped the batch",
                    ))
                })
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Terminate one worker process (health checks and fault-injection
    /// tests). Returns false when the slot holds no live child.
    pub async fn kill_worker(&self, worker: usize) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::KillWorker { worker, reply: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Current worker pids, by slot.
    pub async fn worker_pids(&self) -> Vec<Option<u32>> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::WorkerPids { reply: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Graceful shutdown: workers receive SHUTDOWN and the pool task ends.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::Shutdown { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// `tally-query-worker` next to the current executable.
fn default_worker_command() -> EngineResult<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| EngineError::Fatal(format!("cannot locate current executable: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| EngineError::Fatal("current executable has no parent directory".into()))?;
    Ok(dir.join("tally-query-worker"))
}

struct PoolTask {
    codec: WireCodec,
    init_timeout: Duration,
    init: WorkerInit,
    worker_command: PathBuf,
    workers: Vec<WorkerSlot>,
    pending: HashMap<String, PendingBatch>,
    queue: VecDeque<QueuedBatch>,
    cmd_tx: mpsc::Sender<PoolCommand>,
    cmd_rx: mpsc::Receiver<PoolCommand>,
    ready_tx: watch::Sender<usize>,
    shutting_down: bool,
}

impl PoolTask {
    async fn run(mut self) {
        for worker in 0..self.workers.len() {
            self.spawn_worker(worker).await;
        }

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                PoolCommand::Submit {
                    batch,
                    timeout,
                    max_wait,
                    reply,
                } => self.handle_submit(batch, timeout, max_wait, reply).await,
                PoolCommand::FromWorker {
                    worker,
                    generation,
                    message,
                } => self.handle_worker_message(worker, generation, message).await,
                PoolCommand::WorkerExited { worker, generation } => {
                    self.handle_worker_exit(worker, generation).await;
                }
                PoolCommand::InitTimedOut { worker, generation } => {
                    self.handle_init_timeout(worker, generation);
                }
                PoolCommand::BatchTimedOut { batch_id } => self.handle_batch_timeout(&batch_id),
                PoolCommand::AdmissionTimedOut { batch_id } => {
                    self.handle_admission_timeout(&batch_id);
                }
                PoolCommand::KillWorker { worker, reply } => {
                    let killed = worker < self.workers.len() && self.kill_worker_slot(worker);
                    let _ = reply.send(killed);
                }
                PoolCommand::WorkerPids { reply } => {
                    let _ = reply.send(self.workers.iter().map(|w| w.pid).collect());
                }
                PoolCommand::Shutdown { reply } => {
                    self.handle_shutdown().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    async fn spawn_worker(&mut self, worker: usize) {
        let generation = self.workers[worker].generation + 1;
        let slot = &mut self.workers[worker];
        slot.generation = generation;
        slot.state = WorkerState::Spawning;
        slot.current_batch = None;

        let mut command = Command::new(&self.worker_command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(worker, error = %e, command = %self.worker_command.display(),
                       "failed to spawn query worker");
                slot.state = WorkerState::Dead;
                return;
            }
        };
        counter!("pool_worker_events_total", "event" => "spawned").increment(1);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            error!(worker, "spawned worker is missing stdio pipes");
            let _ = child.start_kill();
            slot.state = WorkerState::Dead;
            return;
        };

        slot.pid = child.id();
        slot.child = Some(child);
        let mut writer = frame_writer(stdin);

        // INIT before anything else; a worker answers READY or ERROR.
        let init = ParentMessage::Init {
            connection_string: self.init.connection_string.clone(),
            database_name: self.init.database_name.clone(),
            database_options: self.init.database_options.clone(),
        };
        match encode_frame(self.codec, &init) {
            Ok(frame) => {
                if let Err(e) = writer.send(frame).await {
                    error!(worker, error = %e, "failed to send INIT");
                    self.kill_worker_slot(worker);
                    return;
                }
            }
            Err(e) => {
                error!(worker, error = %e, "failed to encode INIT");
                self.kill_worker_slot(worker);
                return;
            }
        }
        self.workers[worker].writer = Some(writer);

        // Reader: frames from the worker's stdout feed the command loop.
        let cmd_tx = self.cmd_tx.clone();
        let mut frames = frame_reader(stdout);
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(bytes) => match decode_frame::<WorkerMessage>(&bytes) {
                        Ok((mut message, codec)) => {
                            if codec == WireCodec::Text {
                                message.reinflate_timestamps();
                            }
                            if cmd_tx
                                .send(PoolCommand::FromWorker {
                                    worker,
                                    generation,
                                    message,
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(worker, error = %e, "undecodable frame from worker");
                        }
                    },
                    Err(e) => {
                        warn!(worker, error = %e, "worker channel read error");
                        break;
                    }
                }
            }
            let _ = cmd_tx
                .send(PoolCommand::WorkerExited { worker, generation })
                .await;
        });

        // Per-worker init deadline.
        let cmd_tx = self.cmd_tx.clone();
        let init_timeout = self.init_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(init_timeout).await;
            let _ = cmd_tx
                .send(PoolCommand::InitTimedOut { worker, generation })
                .await;
        });
    }

    async fn handle_submit(
        &mut self,
        batch: Batch,
        timeout: Duration,
        max_wait: Duration,
        reply: oneshot::Sender<BatchOutcome>,
    ) {
        if self.shutting_down {
            let _ = reply.send(Err(QueryError::new(
                QueryErrorKind::NoReadyWorkers,
                "pool is shutting down",
            )));
            return;
        }
        if let Some(worker) = self.find_ready_worker() {
            self.dispatch(worker, batch, timeout, reply, Duration::ZERO).await;
            return;
        }
        if max_wait.is_zero() {
            let _ = reply.send(Err(QueryError::new(
                QueryErrorKind::NoReadyWorkers,
                "no ready workers and no wait budget",
            )));
            return;
        }

        let batch_id = batch.id.clone();
        self.queue.push_back(QueuedBatch {
            batch,
            timeout,
            reply,
            queued_at: Instant::now(),
        });
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(max_wait).await;
            let _ = cmd_tx.send(PoolCommand::AdmissionTimedOut { batch_id }).await;
        });
    }

    async fn dispatch(
        &mut self,
        worker: usize,
        batch: Batch,
        timeout: Duration,
        reply: oneshot::Sender<BatchOutcome>,
        queued_for: Duration,
    ) {
        let batch_id = batch.id.clone();
        let message = ParentMessage::QueryBatch {
            batch_id: batch_id.clone(),
            requests: batch.requests,
        };
        let frame = match encode_frame(self.codec, &message) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(QueryError::storage(format!(
                    "failed to encode batch: {e}"
                ))));
                return;
            }
        };

        let slot = &mut self.workers[worker];
        let Some(writer) = slot.writer.as_mut() else {
            let _ = reply.send(Err(QueryError::new(
                QueryErrorKind::WorkerDied,
                "assigned worker has no channel",
            )));
            return;
        };
        if let Err(e) = writer.send(frame).await {
            warn!(worker, error = %e, "failed to write batch; failing over");
            let _ = reply.send(Err(QueryError::new(
                QueryErrorKind::WorkerDied,
                format!("worker channel write failed: {e}"),
            )));
            self.kill_worker_slot(worker);
            return;
        }

        slot.state = WorkerState::Busy;
        slot.current_batch = Some(batch_id.clone());
        self.pending.insert(
            batch_id.clone(),
            PendingBatch {
                worker,
                reply,
                queued_for,
                dispatched_at: Instant::now(),
            },
        );
        self.publish_ready_count();

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = cmd_tx.send(PoolCommand::BatchTimedOut { batch_id }).await;
        });
    }

    async fn handle_worker_message(
        &mut self,
        worker: usize,
        generation: u64,
        message: WorkerMessage,
    ) {
        if self.workers[worker].generation != generation {
            return; // a previous incarnation of this slot
        }
        match message {
            WorkerMessage::Ready => {
                let slot = &mut self.workers[worker];
                if slot.state == WorkerState::Spawning {
                    slot.state = WorkerState::Ready;
                    slot.respawns = 0;
                    info!(worker, pid = ?slot.pid, "query worker ready");
                    counter!("pool_worker_events_total", "event" => "ready").increment(1);
                }
                self.publish_ready_count();
                self.dispatch_queued().await;
            }
            WorkerMessage::Error { code, message, .. } => {
                warn!(worker, code = %code, message = %message, "worker reported an error");
            }
            WorkerMessage::ResultBatch { batch_id, results } => {
                self.settle_batch(worker, &batch_id, results);
                self.dispatch_queued().await;
            }
            WorkerMessage::Result(result) => {
                debug!(worker, id = %result.id, "single-shot result outside a batch");
            }
        }
    }

    fn settle_batch(&mut self, worker: usize, batch_id: &str, mut results: Vec<QueryResult>) {
        if let Some(pending) = self.pending.remove(batch_id) {
            let wait_ms = pending.queued_for.as_millis() as u64;
            for result in &mut results {
                result.metrics.wait_time = wait_ms;
            }
            metrics::histogram!("pool_batch_exec_seconds")
                .record(pending.dispatched_at.elapsed().as_secs_f64());
            let _ = pending.reply.send(Ok(results));
        }
        let slot = &mut self.workers[worker];
        if slot.state == WorkerState::Busy {
            slot.state = WorkerState::Ready;
        }
        slot.current_batch = None;
        self.publish_ready_count();
    }

    async fn handle_worker_exit(&mut self, worker: usize, generation: u64) {
        if self.workers[worker].generation != generation {
            return;
        }
        let slot = &mut self.workers[worker];
        slot.state = WorkerState::Dead;
        slot.child = None;
        slot.writer = None;
        slot.pid = None;
        counter!("pool_worker_events_total", "event" => "died").increment(1);

        // Fail every pending batch that was assigned to this worker.
        let affected: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.worker == worker)
            .map(|(id, _)| id.clone())
            .collect();
        for batch_id in affected {
            if let Some(pending) = self.pending.remove(&batch_id) {
                let _ = pending.reply.send(Err(QueryError::new(
                    QueryErrorKind::WorkerDied,
                    format!("worker {worker} exited mid-batch"),
                )));
            }
        }
        self.publish_ready_count();

        if self.shutting_down {
            return;
        }
        let respawns = {
            let slot = &mut self.workers[worker];
            slot.respawns += 1;
            slot.respawns
        };
        if respawns > MAX_RESPAWNS {
            error!(worker, respawns, "worker keeps dying; leaving slot dead");
            return;
        }
        warn!(worker, respawns, "respawning dead query worker");
        counter!("pool_worker_events_total", "event" => "respawned").increment(1);
        self.spawn_worker(worker).await;
    }

    fn handle_init_timeout(&mut self, worker: usize, generation: u64) {
        let slot = &self.workers[worker];
        if slot.generation != generation || slot.state != WorkerState::Spawning {
            return;
        }
        warn!(worker, "worker failed to initialize in time");
        self.kill_worker_slot(worker);
    }

    fn handle_batch_timeout(&mut self, batch_id: &str) {
        let Some(pending) = self.pending.remove(batch_id) else {
            return; // settled in time
        };
        let _ = pending.reply.send(Err(QueryError::new(
            QueryErrorKind::BatchTimeout,
            format!(
                "batch {batch_id} exceeded its deadline after {}ms",
                pending.dispatched_at.elapsed().as_millis()
            ),
        )));
        counter!("pool_worker_events_total", "event" => "batch-timeout").increment(1);
        // The worker is stuck on the in-flight pipeline; mark it unhealthy.
        // Its exit triggers the regular respawn path.
        self.kill_worker_slot(pending.worker);
    }

    fn handle_admission_timeout(&mut self, batch_id: &str) {
        let Some(pos) = self.queue.iter().position(|q| q.batch.id == batch_id) else {
            return; // dispatched in time
        };
        let queued = self
            .queue
            .remove(pos)
            .expect("position comes from the same queue");
        let _ = queued.reply.send(Err(QueryError::new(
            QueryErrorKind::NoReadyWorkers,
            "no worker became free within the wait budget",
        )));
    }

    async fn dispatch_queued(&mut self) {
        while let Some(worker) = self.find_ready_worker() {
            let Some(queued) = self.queue.pop_front() else {
                return;
            };
            let queued_for = queued.queued_at.elapsed();
            self.dispatch(worker, queued.batch, queued.timeout, queued.reply, queued_for)
                .await;
        }
    }

    async fn handle_shutdown(&mut self) {
        self.shutting_down = true;
        for worker in 0..self.workers.len() {
            if let Some(writer) = self.workers[worker].writer.as_mut() {
                if let Ok(frame) = encode_frame(self.codec, &ParentMessage::Shutdown) {
                    let _ = writer.send(frame).await;
                }
            }
        }
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(QueryError::new(
                QueryErrorKind::WorkerDied,
                "pool is shutting down",
            )));
        }
        while let Some(queued) = self.queue.pop_front() {
            let _ = queued.reply.send(Err(QueryError::new(
                QueryErrorKind::NoReadyWorkers,
                "pool is shutting down",
            )));
        }
        self.publish_ready_count();
        info!("worker pool shut down");
    }

    fn kill_worker_slot(&mut self, worker: usize) -> bool {
        let slot = &mut self.workers[worker];
        slot.state = WorkerState::Dead;
        slot.writer = None;
        let killed = match slot.child.as_mut() {
            Some(child) => child.start_kill().is_ok(),
            None => false,
        };
        self.publish_ready_count();
        killed
    }

    fn find_ready_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .position(|w| w.state == WorkerState::Ready)
    }

    fn publish_ready_count(&self) {
        let ready = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Ready)
            .count();
        let _ = self.ready_tx.send(ready);
    }
}
