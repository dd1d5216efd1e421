use crate::dispatch::Dispatcher;
use crate::server;
use anyhow::{Context, Result};
use clap::Parser;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser, Clone)]
#[command(
    name = "waddleperf-testserver",
    version,
    about = "Network performance test server: probe engines and bandwidth endpoints"
)]
pub struct Cli {
    /// Address to bind the test server on
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Log filter when RUST_LOG is unset (e.g. info, waddleperf_testserver=debug)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// How long to let in-flight probes drain at shutdown
    #[arg(long, default_value = "10s")]
    pub shutdown_grace: humantime::Duration,
}

pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub async fn run(args: Cli) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::new());
    let app = server::router(dispatcher);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(addr = %args.bind, version = env!("CARGO_PKG_VERSION"), "test server listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .into_future();
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            result.context("server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!(grace = %args.shutdown_grace, "shutdown signal received, draining");
            shutdown.cancel();
            if tokio::time::timeout(args.shutdown_grace.into(), &mut serve)
                .await
                .is_err()
            {
                warn!("drain window elapsed with connections still open");
            }
        }
    }

    Ok(())
}
