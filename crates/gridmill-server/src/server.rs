use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use gridmill_cluster::{ChunkLoad, ClientHandle, ClusterRegistry, RegistryError, ServerPort};
use gridmill_core::types::{
    CalcError, Chunk, ClientId, ClusterName, HookFn, JobKey, JobRef, OutputChunk, OutputItem,
    ServerName, WorkerId, DEFAULT_NUM_CHUNKS, MAX_ATTEMPTS,
};
use gridmill_observe::metrics::{Counter, Gauge};

use crate::backlog::{Assignment, Backlog};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bad_number: worker count must be non-negative")]
    BadNumber,
    #[error("bad_size: chunk request size must be positive")]
    BadSize,
    #[error("server coordinator terminated")]
    Terminated,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("cluster registration failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("cpu count discovery failed: {0}")]
    CpuCount(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cluster: ClusterName,
    pub name: ServerName,
    /// Admission cap for the worker pool; `None` uses the host CPU count.
    pub max_workers: Option<usize>,
    /// Chunk request size advertised to clients.
    pub num_chunks: usize,
}

impl ServerConfig {
    pub fn new(cluster: ClusterName, name: ServerName) -> Self {
        Self {
            cluster,
            name,
            max_workers: None,
            num_chunks: DEFAULT_NUM_CHUNKS,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub chunks_received_total: Counter,
    pub chunks_dispatched_total: Counter,
    pub chunk_requests_total: Counter,
    pub worker_retries_total: Counter,
    pub chunks_failed_total: Counter,
    pub pre_hooks_total: Counter,
    pub post_hooks_total: Counter,
    pub workers_active: Gauge,
    pub workers_active_high_water: Gauge,
    pub backlog_chunks: Gauge,
}

enum WorkerOutcome {
    Normal,
    Abnormal(String),
}

enum Control {
    ChangeWorkerNumber {
        n: i64,
        reply: oneshot::Sender<Result<(), ConfigError>>,
    },
    GetWorkerNumber {
        reply: oneshot::Sender<(usize, usize)>,
    },
    SetNumChunks {
        n: i64,
        reply: oneshot::Sender<Result<usize, ConfigError>>,
    },
    GetNumChunks {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

enum Event<T> {
    ClientData(ClientHandle<T>),
    ProcessChunks(ChunkLoad<T>),
    JobCleanup {
        client: ClientId,
        job: JobRef,
        post: Option<HookFn>,
    },
    NewData,
    WorkerDown {
        id: WorkerId,
        outcome: WorkerOutcome,
    },
    Control(Control),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedState {
    /// At least one worker slot was left unfilled by the last dispatch.
    Waiting,
    /// The last dispatch filled every requested slot.
    Feeding,
}

/// Address of a running server coordinator. Cloneable; all client-protocol
/// methods are fire-and-forget, config methods await a reply.
#[derive(Debug)]
pub struct ServerHandle<T> {
    name: ServerName,
    tx: mpsc::UnboundedSender<Event<T>>,
    metrics: Arc<ServerMetrics>,
}

impl<T> Clone for ServerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T> ServerHandle<T>
where
    T: Send + Sync + 'static,
{
    pub fn name(&self) -> &ServerName {
        &self.name
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    pub async fn change_worker_number(&self, n: i64) -> Result<(), ConfigError> {
        let (reply, rx) = oneshot::channel();
        self.control(Control::ChangeWorkerNumber { n, reply })?;
        rx.await.map_err(|_| ConfigError::Terminated)?
    }

    /// Returns `(workers, max_workers)`.
    pub async fn worker_number(&self) -> Result<(usize, usize), ConfigError> {
        let (reply, rx) = oneshot::channel();
        self.control(Control::GetWorkerNumber { reply })?;
        rx.await.map_err(|_| ConfigError::Terminated)
    }

    pub async fn set_num_chunks(&self, n: i64) -> Result<usize, ConfigError> {
        let (reply, rx) = oneshot::channel();
        self.control(Control::SetNumChunks { n, reply })?;
        rx.await.map_err(|_| ConfigError::Terminated)?
    }

    pub async fn num_chunks(&self) -> Result<usize, ConfigError> {
        let (reply, rx) = oneshot::channel();
        self.control(Control::GetNumChunks { reply })?;
        rx.await.map_err(|_| ConfigError::Terminated)
    }

    /// Stops the event loop after the current handler. In-flight workers are
    /// not joined; their termination events go nowhere.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Control(Control::Shutdown));
    }

    fn control(&self, ctl: Control) -> Result<(), ConfigError> {
        self.tx
            .send(Event::Control(ctl))
            .map_err(|_| ConfigError::Terminated)
    }
}

impl<T> ServerPort<T> for ServerHandle<T>
where
    T: Send + Sync + 'static,
{
    fn server_name(&self) -> &ServerName {
        &self.name
    }

    fn client_data(&self, client: ClientHandle<T>) {
        let _ = self.tx.send(Event::ClientData(client));
    }

    fn process_chunks(&self, load: ChunkLoad<T>) {
        let _ = self.tx.send(Event::ProcessChunks(load));
    }

    fn job_cleanup(&self, client: ClientId, job: JobRef, post: Option<HookFn>) {
        let _ = self.tx.send(Event::JobCleanup { client, job, post });
    }
}

/// Starts a server coordinator: registers it in the cluster, broadcasts
/// `server_up` to every client enumerated there, and spawns the event loop.
///
/// The registry is only consulted here; the coordinator holds no reference to
/// it afterwards. Must be called from within a tokio runtime. Registration
/// failure is fatal; an empty client enumeration is not.
pub fn serve<T>(
    config: ServerConfig,
    registry: &dyn ClusterRegistry<T>,
) -> Result<(ServerHandle<T>, JoinHandle<()>), StartError>
where
    T: Send + Sync + 'static,
{
    let max_workers = match config.max_workers {
        Some(n) => n,
        None => std::thread::available_parallelism()
            .map_err(StartError::CpuCount)?
            .get(),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let metrics = Arc::new(ServerMetrics::default());
    let handle = ServerHandle {
        name: config.name.clone(),
        tx: tx.clone(),
        metrics: metrics.clone(),
    };

    let port: Arc<dyn ServerPort<T>> = Arc::new(handle.clone());
    registry.register_server(&config.cluster, port.clone())?;

    let clients = registry.clients(&config.cluster);
    info!(
        target: "gridmill_proof",
        event = "server_registered",
        server = %config.name,
        cluster = %config.cluster,
        clients = clients.len(),
        max_workers,
        num_chunks = config.num_chunks,
        "server registered in cluster"
    );
    for client in &clients {
        client.server_up(port.clone());
    }

    let coordinator = Coordinator {
        name: config.name,
        state: SchedState::Waiting,
        backlog: Backlog::new(),
        in_flight: HashMap::new(),
        processed: HashSet::new(),
        workers: 0,
        max_workers,
        num_chunks: config.num_chunks,
        next_worker_id: 0,
        self_port: port,
        event_tx: tx,
        metrics,
    };
    let join = tokio::spawn(coordinator.run(rx));
    Ok((handle, join))
}

struct InFlight<T> {
    attempt: u32,
    client: ClientHandle<T>,
    chunk: Chunk<T>,
}

struct Coordinator<T> {
    name: ServerName,
    state: SchedState,
    backlog: Backlog<T>,
    in_flight: HashMap<WorkerId, InFlight<T>>,
    processed: HashSet<JobKey>,
    workers: usize,
    max_workers: usize,
    num_chunks: usize,
    next_worker_id: u64,
    self_port: Arc<dyn ServerPort<T>>,
    event_tx: mpsc::UnboundedSender<Event<T>>,
    metrics: Arc<ServerMetrics>,
}

impl<T> Coordinator<T>
where
    T: Send + Sync + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event<T>>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::ClientData(client) => self.on_client_data(client),
                Event::ProcessChunks(load) => self.on_process_chunks(load),
                Event::JobCleanup { client, job, post } => {
                    self.on_job_cleanup(client, job, post)
                }
                Event::NewData => self.on_new_data(),
                Event::WorkerDown { id, outcome } => self.on_worker_down(id, outcome),
                Event::Control(ctl) => {
                    if self.on_control(ctl) {
                        break;
                    }
                }
            }
            debug_assert_eq!(self.workers, self.in_flight.len());
        }
        info!(server = %self.name, "server coordinator stopped");
    }

    fn on_client_data(&mut self, client: ClientHandle<T>) {
        debug!(
            server = %self.name,
            client = %client.id(),
            num_chunks = self.num_chunks,
            "client announced data; requesting chunks"
        );
        self.metrics.chunk_requests_total.inc();
        client.send_chunks(self.self_port.clone(), self.num_chunks);
    }

    fn on_process_chunks(&mut self, load: ChunkLoad<T>) {
        if load.chunks.is_empty() {
            return;
        }
        let ChunkLoad { client, chunks } = load;
        let chunks: Vec<Chunk<T>> = chunks
            .into_iter()
            .filter(|chunk| match chunk.validate() {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        server = %self.name,
                        client = %chunk.client,
                        job = %chunk.job,
                        seq = chunk.seq,
                        error = %err,
                        "dropping invalid chunk"
                    );
                    false
                }
            })
            .collect();
        if chunks.is_empty() {
            return;
        }

        self.metrics
            .chunks_received_total
            .inc_by(chunks.len() as u64);
        for chunk in &chunks {
            self.run_pre_hook(chunk);
        }
        debug!(
            server = %self.name,
            client = %client.id(),
            chunks = chunks.len(),
            "batch queued"
        );
        self.backlog.push_load(client, chunks);
        self.metrics
            .backlog_chunks
            .set(self.backlog.chunk_count() as u64);
        self.signal_new_data();
    }

    fn run_pre_hook(&mut self, chunk: &Chunk<T>) {
        let key = chunk.job_key();
        if self.processed.contains(&key) {
            return;
        }
        // An absent pre hook leaves the job unmarked, so later batches for the
        // same job re-enter this branch.
        let Some(pre) = chunk.funcs.pre.clone() else {
            return;
        };
        debug!(server = %self.name, client = %key.client, job = %key.job, "running pre-calc hook");
        pre();
        self.metrics.pre_hooks_total.inc();
        self.processed.insert(key);
    }

    fn on_job_cleanup(&mut self, client: ClientId, job: JobRef, post: Option<HookFn>) {
        let key = JobKey { client, job };
        if !self.processed.remove(&key) {
            debug!(
                server = %self.name,
                client = %key.client,
                job = %key.job,
                "cleanup for unprocessed job; ignoring"
            );
            return;
        }
        if let Some(post) = post {
            debug!(server = %self.name, client = %key.client, job = %key.job, "running post-calc hook");
            self.metrics.post_hooks_total.inc();
            // Detached: the hook's duration must not stall the event loop.
            tokio::task::spawn_blocking(move || post());
        }
    }

    fn on_new_data(&mut self) {
        if self.state == SchedState::Feeding {
            return;
        }
        self.dispatch_tick();
    }

    fn signal_new_data(&self) {
        let _ = self.event_tx.send(Event::NewData);
    }

    fn dispatch_tick(&mut self) {
        let need = self.max_workers.saturating_sub(self.workers);
        let dispatch = self.backlog.take(need);
        self.metrics
            .backlog_chunks
            .set(self.backlog.chunk_count() as u64);

        for client in dispatch.refills {
            debug!(
                target: "gridmill_proof",
                event = "refill_requested",
                server = %self.name,
                client = %client.id(),
                count = self.num_chunks,
                "batch drained; requesting more chunks"
            );
            self.metrics.chunk_requests_total.inc();
            client.send_chunks(self.self_port.clone(), self.num_chunks);
        }

        let spawned = dispatch.assignments.len();
        for assignment in dispatch.assignments {
            self.spawn_worker(assignment, 0);
            self.workers += 1;
        }
        self.metrics.workers_active.set(self.workers as u64);
        self.metrics
            .workers_active_high_water
            .max(self.workers as u64);
        self.metrics.chunks_dispatched_total.inc_by(spawned as u64);

        self.state = if spawned == need {
            SchedState::Feeding
        } else {
            SchedState::Waiting
        };
    }

    fn spawn_worker(&mut self, assignment: Assignment<T>, attempt: u32) {
        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;
        self.in_flight.insert(
            id,
            InFlight {
                attempt,
                client: assignment.client.clone(),
                chunk: assignment.chunk.clone(),
            },
        );
        debug!(
            server = %self.name,
            worker_id = %id,
            client = %assignment.client.id(),
            job = %assignment.chunk.job,
            seq = assignment.chunk.seq,
            attempt,
            "worker spawned"
        );

        let server = self.name.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let outcome = match run_calculation(server, assignment.client, assignment.chunk).await
            {
                Ok(()) => WorkerOutcome::Normal,
                Err(err) => WorkerOutcome::Abnormal(err.to_string()),
            };
            let _ = tx.send(Event::WorkerDown { id, outcome });
        });
    }

    fn on_worker_down(&mut self, id: WorkerId, outcome: WorkerOutcome) {
        let Some(entry) = self.in_flight.remove(&id) else {
            warn!(server = %self.name, worker_id = %id, "termination for unknown worker; ignoring");
            return;
        };
        match outcome {
            WorkerOutcome::Normal => {
                self.workers = self.workers.saturating_sub(1);
                self.metrics.workers_active.set(self.workers as u64);
                debug!(
                    server = %self.name,
                    worker_id = %id,
                    job = %entry.chunk.job,
                    seq = entry.chunk.seq,
                    "worker finished"
                );
                self.dispatch_tick();
            }
            WorkerOutcome::Abnormal(reason) => {
                if entry.attempt < MAX_ATTEMPTS {
                    let attempt = entry.attempt + 1;
                    warn!(
                        target: "gridmill_proof",
                        event = "worker_retry",
                        server = %self.name,
                        worker_id = %id,
                        client = %entry.chunk.client,
                        job = %entry.chunk.job,
                        seq = entry.chunk.seq,
                        attempt,
                        reason = %reason,
                        "worker failed; retrying"
                    );
                    self.metrics.worker_retries_total.inc();
                    // The slot is reused; `workers` is unchanged.
                    self.spawn_worker(
                        Assignment {
                            client: entry.client,
                            chunk: entry.chunk,
                        },
                        attempt,
                    );
                } else {
                    self.workers = self.workers.saturating_sub(1);
                    self.metrics.workers_active.set(self.workers as u64);
                    self.metrics.chunks_failed_total.inc();
                    warn!(
                        target: "gridmill_proof",
                        event = "chunk_failed",
                        server = %self.name,
                        worker_id = %id,
                        client = %entry.chunk.client,
                        job = %entry.chunk.job,
                        seq = entry.chunk.seq,
                        reason = %reason,
                        "retries exhausted; reporting failure chunk"
                    );
                    let out = OutputChunk::failure(&entry.chunk, &reason);
                    entry.client.calc_done(self.name.clone(), out);
                    // No dispatch here; the freed slot is picked up by the
                    // next newdata or normal completion.
                }
            }
        }
    }

    fn on_control(&mut self, ctl: Control) -> bool {
        match ctl {
            Control::ChangeWorkerNumber { n, reply } => {
                let _ = reply.send(self.change_worker_number(n));
                false
            }
            Control::GetWorkerNumber { reply } => {
                let _ = reply.send((self.workers, self.max_workers));
                false
            }
            Control::SetNumChunks { n, reply } => {
                let res = match usize::try_from(n) {
                    Ok(size) if size > 0 => {
                        self.num_chunks = size;
                        info!(server = %self.name, num_chunks = size, "chunk request size updated");
                        Ok(size)
                    }
                    _ => Err(ConfigError::BadSize),
                };
                let _ = reply.send(res);
                false
            }
            Control::GetNumChunks { reply } => {
                let _ = reply.send(self.num_chunks);
                false
            }
            Control::Shutdown => true,
        }
    }

    fn change_worker_number(&mut self, n: i64) -> Result<(), ConfigError> {
        let n = usize::try_from(n).map_err(|_| ConfigError::BadNumber)?;
        if n > self.max_workers {
            self.max_workers = n;
            // More capacity may enable queued work; re-evaluate dispatch.
            self.state = SchedState::Waiting;
            self.signal_new_data();
        } else {
            // Shrinking never preempts; running workers drain and the
            // dispatcher declines to refill above the new cap.
            self.max_workers = n;
        }
        info!(
            server = %self.name,
            max_workers = self.max_workers,
            workers = self.workers,
            "worker cap updated"
        );
        Ok(())
    }
}

/// One supervised calculation: applies the chunk's calc function to every
/// datum on the blocking pool and, on full success, sends `calc_done` to the
/// originating client directly. Any per-datum error or panic aborts the whole
/// worker abnormally.
async fn run_calculation<T>(
    server: ServerName,
    client: ClientHandle<T>,
    chunk: Chunk<T>,
) -> Result<(), CalcError>
where
    T: Send + Sync + 'static,
{
    let calc = chunk.funcs.calc.clone();
    let data = chunk.data.clone();
    let out = tokio::task::spawn_blocking(move || -> Result<Vec<OutputItem<T>>, CalcError> {
        let mut out = Vec::with_capacity(data.len());
        for value in data.iter() {
            out.push(OutputItem::Value(calc(value)?));
        }
        Ok(out)
    })
    .await
    .map_err(join_reason)??;

    client.calc_done(
        server,
        OutputChunk {
            job: chunk.job.clone(),
            seq: chunk.seq,
            data: out,
        },
    );
    Ok(())
}

fn join_reason(err: JoinError) -> CalcError {
    if err.is_panic() {
        let payload = err.into_panic();
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "calculation panicked".to_string());
        CalcError::new(reason)
    } else {
        CalcError::new("calculation cancelled")
    }
}
