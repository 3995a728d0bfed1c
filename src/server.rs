//! TCP server wrapping the connection state machine.
//!
//! Owns the resolved configuration, the dispatch strategy, the metrics sink
//! and the shared buffer pool. Connections hold an `Arc<Server>` and only
//! read from it.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::metrics::{Metrics, ServerMetrics};
use crate::runtime::{BufferPool, CloseReason, Connection, Dispatch};

/// Resolved settings consumed by the server and its connections.
///
/// Zero durations mean "no deadline".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Deadline for reading one request once its first byte arrived.
    pub read_timeout: Duration,
    /// Deadline for writing one reply, armed before the handler runs.
    pub write_timeout: Duration,
    /// Maximum wait for the next request. Falls back to `read_timeout` when zero.
    pub idle_timeout: Duration,
    /// Serve more than one request per connection.
    pub keep_alive: bool,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Initial capacity of pooled read/write buffers.
    pub buffer_size: usize,
    /// Maximum number of idle buffers kept in the pool.
    pub pool_capacity: usize,
}

impl ServerConfig {
    /// Effective idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        if self.idle_timeout.is_zero() {
            self.read_timeout
        } else {
            self.idle_timeout
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            keep_alive: true,
            max_connections: 10_000,
            buffer_size: 8 * 1024,
            pool_capacity: 1024,
        }
    }
}

/// Server instance
pub struct Server {
    config: ServerConfig,
    dispatch: Box<dyn Dispatch>,
    metrics: Arc<dyn Metrics>,
    pool: BufferPool,
    shutting_down: AtomicBool,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Create a server with the built-in [`ServerMetrics`].
    pub fn new(config: ServerConfig, dispatch: impl Dispatch) -> Arc<Self> {
        Self::with_metrics(config, dispatch, Arc::new(ServerMetrics::new()))
    }

    /// Create a server reporting to `metrics`.
    pub fn with_metrics(
        config: ServerConfig,
        dispatch: impl Dispatch,
        metrics: Arc<dyn Metrics>,
    ) -> Arc<Self> {
        let pool = BufferPool::new(config.pool_capacity, config.buffer_size);
        Arc::new(Server {
            config,
            dispatch: Box::new(dispatch),
            metrics,
            pool,
            shutting_down: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Resolved configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Dispatch strategy.
    pub fn dispatch(&self) -> &dyn Dispatch {
        self.dispatch.as_ref()
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &dyn Metrics {
        self.metrics.as_ref()
    }

    /// Shared buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Whether connections should wait for another request after a reply.
    pub fn keep_alive_enabled(&self) -> bool {
        self.config.keep_alive && !self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop keep-alive so live connections close after their current exchange.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Whether [`Server::begin_shutdown`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Serve one already-accepted stream to completion.
    pub async fn serve_stream<S>(self: Arc<Self>, stream: S, name: String) -> CloseReason
    where
        S: AsyncRead + AsyncWrite,
    {
        let mut conn = Connection::new(name, self, stream);
        conn.serve().await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Each connection runs on its own task; a failing or panicking
    /// connection never affects the accept loop or its siblings.
    pub async fn run<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let permits = self.config.max_connections.min(Semaphore::MAX_PERMITS);
        let connection_limit = Arc::new(Semaphore::new(permits));
        info!(
            address = %listener.local_addr()?,
            convention = self.dispatch.name(),
            "Server listening"
        );

        tokio::pin!(shutdown);
        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let name = format!("conn-{id}-{peer}");
                    debug!(conn = %name, "New connection");

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.serve_stream(stream, name).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        self.begin_shutdown();
        info!("Server stopped accepting connections");
        Ok(())
    }
}

/// Bind a listening socket with `SO_REUSEADDR` set.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}
