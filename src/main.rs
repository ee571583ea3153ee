use std::sync::Arc;

use anyhow::Context;
use async_jobs::executor::ExecutorRegistry;
use async_jobs::executor::builtin::register_builtins;
use async_jobs::store::{JobStore, LibSqlJobStore};
use async_jobs::{JobService, JobsConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = JobsConfig::from_env().context("invalid JOBS_* configuration")?;

    eprintln!("⚙️  Async Jobs v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.worker_count);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlJobStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Executors ────────────────────────────────────────────────────────
    let registry = Arc::new(ExecutorRegistry::new());
    register_builtins(&registry).await?;

    // ── Job service ──────────────────────────────────────────────────────
    let service = JobService::new(config, store, registry);
    service.start().await?;
    eprintln!("   Press Ctrl-C to stop.\n");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    service.shutdown().await;
    Ok(())
}
