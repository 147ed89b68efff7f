#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Single-host demo daemon: wires an in-memory cluster with one synthetic
//! client coordinator and one server coordinator, runs every job to
//! completion, and reports throughput.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tracing::{info, info_span, warn, Instrument};

use gridmill_cluster::{ChunkLoad, ClientEvent, ClientHandle, MemoryRegistry, ServerPort};
use gridmill_core::types::{
    CalcError, CalcFn, Chunk, ChunkFuncs, ClientId, ClusterName, HookFn, JobRef, ServerName,
};
use gridmill_observe::time::unix_time_ms;
use gridmill_server::server::{serve, ServerConfig, ServerMetrics};

#[derive(Debug, Parser)]
#[command(name = "gridmilld")]
struct Args {
    #[arg(long, env = "GRIDMILL_CLUSTER", default_value = "local")]
    cluster: String,

    #[arg(long, env = "GRIDMILL_SERVER_NAME", default_value = "server-1")]
    server_name: String,

    #[arg(long, env = "GRIDMILL_CLIENT_ID", default_value = "client-1")]
    client_id: String,

    /// Number of synthetic jobs the client holds.
    #[arg(long, env = "GRIDMILL_JOBS", default_value_t = 2)]
    jobs: usize,

    #[arg(long, env = "GRIDMILL_CHUNKS_PER_JOB", default_value_t = 16)]
    chunks_per_job: usize,

    #[arg(long, env = "GRIDMILL_DATUMS_PER_CHUNK", default_value_t = 32)]
    datums_per_chunk: usize,

    /// Worker pool cap; 0 uses the host CPU count.
    #[arg(long, env = "GRIDMILL_WORKERS", default_value_t = 0)]
    workers: usize,

    /// Artificially slow down each datum to make the pool visible.
    #[arg(long, env = "GRIDMILL_CALC_SLEEP_MS", default_value_t = 0)]
    calc_sleep_ms: u64,

    /// Periodically emit a metrics snapshot (0 disables).
    #[arg(long, env = "GRIDMILL_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 1000)]
    metrics_snapshot_interval_ms: u64,
}

fn emit_metrics_snapshot(metrics: &ServerMetrics, server: &str, cluster: &str) {
    tracing::info!(
        target: "gridmill_metrics",
        server = %server,
        cluster = %cluster,
        unix_time_ms = unix_time_ms(),
        chunks_received_total = metrics.chunks_received_total.get(),
        chunks_dispatched_total = metrics.chunks_dispatched_total.get(),
        chunk_requests_total = metrics.chunk_requests_total.get(),
        worker_retries_total = metrics.worker_retries_total.get(),
        chunks_failed_total = metrics.chunks_failed_total.get(),
        pre_hooks_total = metrics.pre_hooks_total.get(),
        post_hooks_total = metrics.post_hooks_total.get(),
        workers_active = metrics.workers_active.get(),
        workers_active_high_water = metrics.workers_active_high_water.get(),
        backlog_chunks = metrics.backlog_chunks.get(),
        "metrics"
    );
}

struct SyntheticJobs {
    pending: Vec<Chunk<i64>>,
    remaining: HashMap<JobRef, usize>,
    post_hooks_run: Arc<AtomicU64>,
}

fn build_jobs(args: &Args, client: &ClientId) -> SyntheticJobs {
    let post_hooks_run = Arc::new(AtomicU64::new(0));
    let sleep = Duration::from_millis(args.calc_sleep_ms);
    let calc: CalcFn<i64> = Arc::new(move |v: &i64| -> Result<i64, CalcError> {
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
        Ok(v * 2)
    });

    let mut pending = Vec::with_capacity(args.jobs * args.chunks_per_job);
    let mut remaining = HashMap::new();
    for j in 0..args.jobs {
        let job = JobRef(format!("job-{j}"));
        remaining.insert(job.clone(), args.chunks_per_job);
        let pre_job = job.clone();
        let pre: HookFn = Arc::new(move || {
            info!(job = %pre_job, "pre-calculation hook");
        });
        for seq in 0..args.chunks_per_job {
            let base = (j * args.chunks_per_job + seq) as i64;
            let data: Vec<i64> = (0..args.datums_per_chunk as i64)
                .map(|k| base * 1000 + k)
                .collect();
            pending.push(Chunk::new(
                client.clone(),
                job.clone(),
                seq as u64,
                ChunkFuncs::new(calc.clone()).with_pre(pre.clone()),
                data,
            ));
        }
    }

    SyntheticJobs {
        pending,
        remaining,
        post_hooks_run,
    }
}

/// Minimal client coordinator: announces data to servers that come up, serves
/// pull requests head-first from its pending queue, collects `calc_done`, and
/// issues `job_cleanup` when a job's last output chunk arrives.
async fn run_client(
    mut rx: UnboundedReceiver<ClientEvent<i64>>,
    handle: ClientHandle<i64>,
    mut jobs: SyntheticJobs,
    done: oneshot::Sender<(u64, u64)>,
) {
    let client_id = handle.id().clone();
    let mut server_port: Option<Arc<dyn ServerPort<i64>>> = None;
    let mut outputs: u64 = 0;
    let mut failed_items: u64 = 0;

    while let Some(event) = rx.recv().await {
        match event {
            ClientEvent::ServerUp { server } => {
                info!(client = %client_id, server = %server.server_name(), "server up; announcing data");
                server.client_data(handle.clone());
                server_port = Some(server);
            }
            ClientEvent::SendChunks { server, count } => {
                if jobs.pending.is_empty() {
                    continue;
                }
                let take = count.min(jobs.pending.len());
                let chunks: Vec<Chunk<i64>> = jobs.pending.drain(..take).collect();
                server.process_chunks(ChunkLoad::new(handle.clone(), chunks));
                server_port = Some(server);
            }
            ClientEvent::CalcDone { server, chunk } => {
                outputs += 1;
                failed_items += chunk.data.iter().filter(|i| i.is_failed()).count() as u64;
                let job_done = match jobs.remaining.get_mut(&chunk.job) {
                    Some(left) => {
                        *left = left.saturating_sub(1);
                        *left == 0
                    }
                    None => {
                        warn!(client = %client_id, job = %chunk.job, "calc_done for unknown job");
                        false
                    }
                };
                if job_done {
                    jobs.remaining.remove(&chunk.job);
                    let post_job = chunk.job.clone();
                    let counter = jobs.post_hooks_run.clone();
                    let post: HookFn = Arc::new(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                        info!(job = %post_job, "post-calculation hook");
                    });
                    info!(client = %client_id, job = %chunk.job, server = %server, "job complete; cleaning up");
                    if let Some(port) = &server_port {
                        port.job_cleanup(client_id.clone(), chunk.job.clone(), Some(post));
                    }
                }
                if jobs.remaining.is_empty() {
                    let _ = done.send((outputs, failed_items));
                    return;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    gridmill_observe::logging::init_tracing();
    let args = Args::parse();

    let span = info_span!(
        "gridmilld",
        cluster = %args.cluster,
        server = %args.server_name,
        client = %args.client_id,
        jobs = args.jobs,
        chunks_per_job = args.chunks_per_job,
        datums_per_chunk = args.datums_per_chunk,
    );

    async move {
        let cluster = ClusterName(args.cluster.clone());
        let registry = MemoryRegistry::<i64>::new();

        let (client_handle, client_rx) = ClientHandle::new(ClientId(args.client_id.clone()));
        registry.register_client(&cluster, client_handle.clone());

        let jobs = build_jobs(&args, client_handle.id());
        let total_chunks = jobs.pending.len() as u64;
        let (done_tx, done_rx) = oneshot::channel();
        let client_task = tokio::spawn(run_client(client_rx, client_handle, jobs, done_tx));

        let mut config = ServerConfig::new(cluster.clone(), ServerName(args.server_name.clone()));
        if args.workers > 0 {
            config.max_workers = Some(args.workers);
        }
        let (server, _server_join) = serve(config, &registry)?;
        let metrics = server.metrics();

        let metrics_task = if args.metrics_snapshot_interval_ms > 0 {
            let metrics = metrics.clone();
            let server_name = args.server_name.clone();
            let cluster_name = args.cluster.clone();
            let interval_ms = args.metrics_snapshot_interval_ms.max(1);
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    ticker.tick().await;
                    emit_metrics_snapshot(&metrics, &server_name, &cluster_name);
                }
            }))
        } else {
            None
        };

        let start = Instant::now();
        info!("starting single-host compute fabric demo");

        tokio::select! {
            res = done_rx => {
                let (outputs, failed_items) = res?;
                let elapsed = start.elapsed();
                let throughput = if elapsed.as_secs_f64() > 0.0 {
                    outputs as f64 / elapsed.as_secs_f64()
                } else {
                    0.0
                };
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    output_chunks = outputs,
                    expected_chunks = total_chunks,
                    failed_items = failed_items,
                    chunks_per_sec = throughput,
                    "demo complete"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("ctrl-c received; exiting");
            }
        }

        if let Some(task) = metrics_task {
            task.abort();
        }
        client_task.abort();
        emit_metrics_snapshot(&metrics, &args.server_name, &args.cluster);
        server.shutdown();
        Ok(())
    }
    .instrument(span)
    .await
}
