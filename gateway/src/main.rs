mod config;
mod logging;
mod middleware;
mod routes;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::{net::TcpListener, signal};
use workrelay::{LogObserver, WorkerPool};

use crate::config::{CliArgs, GatewayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::try_from(CliArgs::parse())?;
    logging::init(config.log_format);

    let mut pool = WorkerPool::new(config.pool.clone());
    let collector = pool.on_response(LogObserver)?;
    let pool = Arc::new(pool);

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("unable to listen on {}:{}", config.host, config.port))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        workers = pool.size(),
        env = ?config.pool.env,
        "gateway listening"
    );

    axum::serve(listener, routes::router(Arc::clone(&pool)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    match pool.shutdown().await {
        Ok(()) => collector.join().await,
        Err(err) => tracing::warn!("{err}, not waiting for pending responses"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("unable to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("unable to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received ctrl-c"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
