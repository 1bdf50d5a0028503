//! Entry point for the VM export orchestration daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmexport_core::config::Config;
use vmexport_core::store::postgres::PostgresStore;
use vmexport_core::store::Store;
use vmexport_core::server::build_app;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vmexport_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting vmexportd");

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!("configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("migrations complete");

    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool));

    let (router, job_manager, scheduler, network_monitor, pool) =
        build_app(&config, store).await;

    let shutdown = CancellationToken::new();

    let dispatcher_ctx = shutdown.child_token();
    let dispatcher_handle = tokio::spawn(job_manager.clone().run_dispatcher(dispatcher_ctx));

    let scheduler_ctx = shutdown.child_token();
    let scheduler_handle = tokio::spawn(scheduler.clone().run(scheduler_ctx));

    let network_ctx = shutdown.child_token();
    let network_handle = tokio::spawn(
        network_monitor
            .clone()
            .run(config.network_monitor.poll_interval, network_ctx),
    );

    let sweeper_handle = pool.clone().map(|p| {
        let sweeper_ctx = shutdown.child_token();
        tokio::spawn(p.run_idle_sweeper(sweeper_ctx))
    });

    let addr = format!("{}:{}", config.bind_addr, config.port);
    tracing::info!(addr, "binding http server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutdown signal received, stopping background tasks");
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    dispatcher_handle.await.ok();
    scheduler_handle.await.ok();
    network_handle.await.ok();
    if let Some(handle) = sweeper_handle {
        handle.await.ok();
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

