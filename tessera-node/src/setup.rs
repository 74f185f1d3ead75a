use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::prelude::*;

use tessera_common::error::Result;

pub const DEFAULT_LOG_FILTER: &str = "info,tessera_consensus=debug";

/// Stdout gets everything allowed by `RUST_LOG`; `<data_dir>/logs/audit-<node>.log`
/// gets the `consensus` target only. Keep the guard alive or the file layer
/// stops flushing.
pub fn init_tracing(data_dir: &Path, node: &str) -> Result<WorkerGuard> {
    let logs = data_dir.join("logs");
    fs::create_dir_all(&logs)?;
    let file_appender = tracing_appender::rolling::never(&logs, format!("audit-{node}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let consensus_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(filter_fn(|metadata| metadata.target() == "consensus"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    );

    // a second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry().with(consensus_layer).with(stdout_layer).try_init();
    Ok(guard)
}

/// Stdout only, for commands that never touch a data directory.
pub fn init_stdout_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .try_init();
}
