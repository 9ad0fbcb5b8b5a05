use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use lap_core::auth::StaticUserProvider;
use lap_core::config::Config;
use lap_core::db::NullDatabaseClient;
use lap_core::LapPipeline;

/// Thin demo binary: wires the pipeline together with a no-op database
/// client so the crate can be smoke-tested without a real backend. A
/// host application supplies its own `DatabaseClient` and
/// `CurrentUserProvider` implementations in their place.
#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(true)
        .init();

    info!("lap-core v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().unwrap_or_else(|err| {
        tracing::error!("invalid configuration: {err}, falling back to defaults");
        Config::default()
    });

    let db = Arc::new(NullDatabaseClient);
    let auth = Arc::new(StaticUserProvider::new());

    let (pipeline, worker_handle, probe_handle) = LapPipeline::new(&config, db, auth);

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested");
    pipeline.shutdown().await;
    let _ = tokio::join!(worker_handle, probe_handle);

    let snapshot = pipeline.supervisor_snapshot();
    info!(?snapshot, "final supervisor snapshot");
}
