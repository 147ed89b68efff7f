use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `GRIDMILL_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for gridmill daemons:
/// - Always include `server` on coordinator-scoped events.
/// - Include `client` and `job` on any chunk-path event.
/// - Include `worker_id` and `attempt` on supervision events.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("GRIDMILL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
