//! Standalone entry point: wires an in-memory user directory and a
//! synthetic template provider into `PoolCoordinator` and runs it.
//!
//! A real deployment supplies its own `UserDirectory`/`MinerRegistrar`
//! (backed by whatever account store it runs) and `TemplateProvider`
//! (backed by a node RPC or template service) instead of the
//! in-memory/static stand-ins used here — see `crate::auth::directory`
//! and `crate::job`.

use std::sync::Arc;

use stratum_pool_core::auth::InMemoryDirectory;
use stratum_pool_core::config::Config;
use stratum_pool_core::job::StaticTemplateProvider;
use stratum_pool_core::pool::PoolCoordinator;

#[tokio::main]
async fn main() {
    let config = Config::load();

    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| tracing_subscriber::EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new(&config.log_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::info!(listen = %config.listen_address, shards = config.shard_count, "starting stratum-pool-core");

    let directory = Arc::new(InMemoryDirectory::new());
    let template_provider = Arc::new(StaticTemplateProvider::new(1));

    let pool = PoolCoordinator::new(config, directory, template_provider);

    let pool_handle = pool.clone();
    let serve = tokio::spawn(async move {
        if let Err(e) = pool_handle.start().await {
            tracing::error!(error = %e, "pool coordinator exited");
        }
    });

    let shutdown_signal = async {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                _ = ctrl_c => tracing::info!("SIGINT received, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.expect("failed to register Ctrl+C handler");
            tracing::info!("Ctrl+C received, shutting down");
        }
    };

    tokio::select! {
        _ = serve => {}
        _ = shutdown_signal => {
            pool.stop().await;
            let _ = serve.await;
        }
    }
}
