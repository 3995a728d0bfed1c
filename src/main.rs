//! vsock-serve: a length-prefixed binary protocol server
//!
//! Serves a small set of demo handlers over either dispatch convention:
//! - path: `/echo`, `/ping`, `/error`
//! - code: `1` echo, `2` ping
//!
//! Configuration via CLI arguments or TOML file.

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vsock_serve::config::{Config, Convention};
use vsock_serve::handler::{CodeRegistry, PathRegistry};
use vsock_serve::metrics::{Metrics, ServerMetrics};
use vsock_serve::runtime::{install_panic_hook, CodeDispatch, PathDispatch};
use vsock_serve::server::{bind, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    install_panic_hook();

    info!(
        listen = %config.listen,
        convention = ?config.convention,
        read_timeout_ms = config.read_timeout.as_millis() as u64,
        write_timeout_ms = config.write_timeout.as_millis() as u64,
        idle_timeout_ms = config.idle_timeout.as_millis() as u64,
        keep_alive = config.keep_alive,
        max_connections = config.max_connections,
        "Starting vsock-serve"
    );

    let metrics = Arc::new(ServerMetrics::new());
    let sink = Arc::clone(&metrics) as Arc<dyn Metrics>;
    let server = match config.convention {
        Convention::Path => {
            let registry = path_handlers();
            let mut paths: Vec<_> = registry.paths().collect();
            paths.sort_unstable();
            info!(paths = ?paths, "Registered path handlers");
            Server::with_metrics(config.server_config(), PathDispatch::new(registry), sink)
        }
        Convention::Code => {
            let registry = code_handlers();
            info!(handlers = registry.len(), "Registered code handlers");
            Server::with_metrics(config.server_config(), CodeDispatch::new(registry), sink)
        }
    };

    let listener = bind(config.listen)?;
    server.run(listener, shutdown_signal()).await?;

    info!(
        total_connections = metrics.total_connections(),
        live_connections = metrics.live_connections(),
        requests = metrics.read_latency().count(),
        mean_read_us = metrics.read_latency().mean().as_micros() as u64,
        mean_write_us = metrics.write_latency().mean().as_micros() as u64,
        "Shutdown complete"
    );
    Ok(())
}

fn path_handlers() -> PathRegistry {
    let mut registry = PathRegistry::new();
    registry
        .register("/echo", |req| Ok(req.to_vec()))
        .register("/ping", |_| Ok(b"pong".to_vec()))
        .register("/error", |req| {
            Err(String::from_utf8_lossy(req).into_owned().into())
        });
    registry
}

fn code_handlers() -> CodeRegistry {
    let mut registry = CodeRegistry::new();
    registry
        .register(1, |_, body| body.to_vec())
        .register(2, |_, _| b"pong".to_vec());
    registry
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
