use worker_pool::config::PoolConfig;
use worker_pool::http;
use worker_pool::pool::WorkPool;

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

    let config = PoolConfig::from_env()?;

    eprintln!("Worker Pool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://{}", config.bind_addr);
    eprintln!(
        "   Lease TTL: {}s, reconcile every {}s, worker timeout {}s",
        config.lease.lease_ttl.as_secs(),
        config.reconciler.interval.as_secs(),
        config.reconciler.liveness_threshold.as_secs()
    );

    let pool = WorkPool::open(config.clone())
        .await
        .map_err(|e| anyhow::anyhow!("failed to open database at {}: {e}", config.db_path.display()))?;

    pool.reconciler().start().await;

    let listener = tokio::net::TcpListener::bind(config.bind_addr.as_str()).await?;
    tracing::info!(addr = %config.bind_addr, "Listening");

    axum::serve(listener, http::router(pool.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.reconciler().stop().await;
    eprintln!("   Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
