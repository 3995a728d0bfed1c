//! Connection state machine.
//!
//! Each accepted stream is driven through:
//!
//! ```text
//! IdleWait ──► ActiveRead ──► Dispatch ──► ActiveWrite ──┐
//!    ▲            │                            │         │
//!    └────────────┴──── (keep-alive) ◄─────────┘         ▼
//!                                                      Closed
//! ```
//!
//! Idle waiting and request reading use independent deadlines: a quiet
//! connection is bounded by the idle timeout, an in-flight message by the
//! read timeout. The write deadline is armed before the handler runs.

use bytes::Bytes;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::error::{FrameError, Status};
use crate::protocol::{read_message, write_message, Header};
use crate::runtime::buffer::{PooledReader, PooledWriter};
use crate::runtime::deadline::{deadline_after, with_deadline};
use crate::runtime::dispatch::Reply;
use crate::runtime::panic_message;
use crate::server::Server;

/// Current state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Waiting for the first byte of the next request.
    IdleWait,
    /// Reading a request frame.
    ActiveRead,
    /// Invoking the handler for a decoded request.
    Dispatch {
        /// Request header.
        header: Header,
        /// Request body.
        body: Bytes,
    },
    /// Writing the reply.
    ActiveWrite {
        /// Request header, echoed back with the reply's code.
        header: Header,
        /// Reply to write.
        reply: Reply,
        /// Write deadline armed before dispatch.
        deadline: Option<Instant>,
    },
    /// Terminal state.
    Closed(CloseReason),
}

/// Why a connection was closed.
#[derive(Debug, Error)]
pub enum CloseReason {
    /// Peer closed the stream between requests.
    #[error("peer closed the connection")]
    PeerClosed,
    /// No request arrived within the idle timeout.
    #[error("idle timeout")]
    IdleTimeout,
    /// Reading a request failed in a way that desynchronizes the stream.
    #[error("read failed: {0}")]
    Read(FrameError),
    /// Writing a reply failed.
    #[error("write failed: {0}")]
    Write(FrameError),
    /// A handler panicked and the convention has no way to report it.
    #[error("handler panicked")]
    HandlerPanic,
    /// Keep-alive is off, so the connection ends after one exchange.
    #[error("keep-alive disabled")]
    KeepAliveDisabled,
    /// Closed by the server without serving.
    #[error("closed by server")]
    Requested,
    /// `serve` was called on a connection that is already closed.
    #[error("connection already closed")]
    AlreadyClosed,
}

/// Buffered halves of the stream, on loan from the server's pool.
struct ConnIo<S> {
    reader: PooledReader<ReadHalf<S>>,
    writer: PooledWriter<WriteHalf<S>>,
}

/// One accepted stream and the resources it holds.
///
/// Opening a connection increments the server's live-connection gauge;
/// closing or dropping it decrements the gauge exactly once and returns its
/// buffers to the pool.
pub struct Connection<S> {
    name: String,
    server: Arc<Server>,
    io: Option<ConnIo<S>>,
    closed: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap `stream`, borrowing buffers from the server's pool.
    pub fn new(name: impl Into<String>, server: Arc<Server>, stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let io = ConnIo {
            reader: server.pool().reader(read_half),
            writer: server.pool().writer(write_half),
        };
        server.metrics().connection_opened();
        Self {
            name: name.into(),
            server,
            io: Some(io),
            closed: false,
        }
    }

    /// Serve requests until the connection closes, then release it.
    pub async fn serve(&mut self) -> CloseReason {
        let Some(mut io) = self.io.take() else {
            return CloseReason::AlreadyClosed;
        };

        let reason = self.run(&mut io).await;
        self.shutdown(io).await;
        self.mark_closed(&reason);
        reason
    }

    /// Close without serving. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(io) = self.io.take() {
            self.shutdown(io).await;
        }
        self.mark_closed(&CloseReason::Requested);
    }

    async fn run(&self, io: &mut ConnIo<S>) -> CloseReason {
        let mut state = ConnState::IdleWait;
        loop {
            state = match state {
                ConnState::IdleWait => self.wait_next(io).await,
                ConnState::ActiveRead => self.read_request(io).await,
                ConnState::Dispatch { header, body } => self.dispatch(header, body),
                ConnState::ActiveWrite {
                    header,
                    reply,
                    deadline,
                } => self.write_reply(io, header, reply, deadline).await,
                ConnState::Closed(reason) => return reason,
            };
        }
    }

    /// Block until at least one byte of the next request is buffered.
    async fn wait_next(&self, io: &mut ConnIo<S>) -> ConnState {
        let deadline = deadline_after(self.server.config().idle_timeout());
        let peeked = with_deadline(deadline, io.reader.peek()).await;
        match peeked {
            Ok(Ok(_)) => ConnState::ActiveRead,
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                ConnState::Closed(CloseReason::PeerClosed)
            }
            Ok(Err(e)) => ConnState::Closed(CloseReason::Read(FrameError::Io(e))),
            Err(_) => ConnState::Closed(CloseReason::IdleTimeout),
        }
    }

    async fn read_request(&self, io: &mut ConnIo<S>) -> ConnState {
        let deadline = deadline_after(self.server.config().read_timeout);
        let started = Instant::now();
        let result = read_message(&mut io.reader, deadline).await;
        self.server.metrics().record_read(started.elapsed());

        match result {
            Ok((header, body)) => {
                trace!(conn = %self.name, code = header.code, len = header.length, "request");
                ConnState::Dispatch { header, body }
            }
            Err(e) if !e.is_broken() => {
                debug!(conn = %self.name, error = %e, "no request this cycle");
                ConnState::IdleWait
            }
            Err(e) => ConnState::Closed(CloseReason::Read(e)),
        }
    }

    fn dispatch(&self, header: Header, body: Bytes) -> ConnState {
        let deadline = deadline_after(self.server.config().write_timeout);
        let dispatch = self.server.dispatch();

        match catch_unwind(AssertUnwindSafe(|| dispatch.dispatch(&header, body))) {
            Ok(reply) => ConnState::ActiveWrite {
                header,
                reply,
                deadline,
            },
            Err(panic) => {
                error!(
                    conn = %self.name,
                    convention = dispatch.name(),
                    code = header.code,
                    panic = panic_message(panic.as_ref()),
                    "handler panicked"
                );
                match dispatch.recover() {
                    Some(reply) => ConnState::ActiveWrite {
                        header,
                        reply,
                        deadline,
                    },
                    None => ConnState::Closed(CloseReason::HandlerPanic),
                }
            }
        }
    }

    async fn write_reply(
        &self,
        io: &mut ConnIo<S>,
        header: Header,
        reply: Reply,
        deadline: Option<Instant>,
    ) -> ConnState {
        let started = Instant::now();
        let result = write_message(
            &mut io.writer,
            header.reply(reply.code, 0),
            &reply.body,
            deadline,
        )
        .await;
        self.server.metrics().record_write(started.elapsed());

        match result {
            Ok(()) if self.server.keep_alive_enabled() => ConnState::IdleWait,
            Ok(()) => ConnState::Closed(CloseReason::KeepAliveDisabled),
            Err(FrameError::TooLarge(len)) => {
                warn!(conn = %self.name, len, "reply exceeds frame limit");
                ConnState::ActiveWrite {
                    header,
                    reply: self.server.dispatch().status(Status::ResponseTooLarge),
                    deadline,
                }
            }
            Err(e) => ConnState::Closed(CloseReason::Write(e)),
        }
    }

    async fn shutdown(&self, mut io: ConnIo<S>) {
        let deadline = deadline_after(self.server.config().write_timeout);
        if let Ok(Err(e)) = with_deadline(deadline, io.writer.shutdown()).await {
            trace!(conn = %self.name, error = %e, "shutdown failed");
        }
        self.release(io);
    }
}

impl<S> Connection<S> {
    /// Connection name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn release(&self, io: ConnIo<S>) {
        let pool = self.server.pool();
        pool.reclaim_reader(io.reader);
        pool.reclaim_writer(io.writer);
    }

    fn mark_closed(&mut self, reason: &CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.server.metrics().connection_closed();
        debug!(conn = %self.name, reason = %reason, "connection closed");
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        if let Some(io) = self.io.take() {
            self.release(io);
        }
        self.mark_closed(&CloseReason::Requested);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{CodeRegistry, PathRegistry};
    use crate::metrics::ServerMetrics;
    use crate::protocol::{RequestEnvelope, ResponseEnvelope, HEADER_SIZE};
    use crate::runtime::dispatch::{CodeDispatch, PathDispatch};
    use crate::server::ServerConfig;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn registry() -> PathRegistry {
        let mut registry = PathRegistry::new();
        registry
            .register("/echo", |req| Ok(req.to_vec()))
            .register("/panic", |_| panic!("boom"));
        registry
    }

    fn server(config: ServerConfig) -> (Arc<Server>, Arc<ServerMetrics>) {
        let metrics = Arc::new(ServerMetrics::new());
        let server = Server::with_metrics(
            config,
            PathDispatch::new(registry()),
            Arc::clone(&metrics) as Arc<dyn crate::metrics::Metrics>,
        );
        (server, metrics)
    }

    async fn send(client: &mut DuplexStream, path: &str, req: &[u8]) {
        let body = RequestEnvelope::new(path, Bytes::copy_from_slice(req))
            .encode()
            .unwrap();
        client
            .write_all(&Header::new(0, body.len() as u16).encode())
            .await
            .unwrap();
        client.write_all(&body).await.unwrap();
    }

    async fn recv(client: &mut DuplexStream) -> (Header, ResponseEnvelope) {
        let mut raw = [0u8; HEADER_SIZE];
        client.read_exact(&mut raw).await.unwrap();
        let header = Header::decode(&raw).unwrap();
        let mut body = vec![0u8; header.length as usize];
        client.read_exact(&mut body).await.unwrap();
        (header, ResponseEnvelope::decode(&body).unwrap())
    }

    #[tokio::test]
    async fn test_echo_then_peer_close() {
        let (server, metrics) = server(ServerConfig::default());
        let (mut client, stream) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut conn = Connection::new("test", server, stream);
            conn.serve().await
        });

        send(&mut client, "/echo", b"hi").await;
        let (header, envelope) = recv(&mut client).await;
        assert_eq!(header.code, 0);
        assert_eq!(envelope, ResponseEnvelope::Ok(Bytes::from_static(b"hi")));

        drop(client);
        let reason = task.await.unwrap();
        assert!(matches!(reason, CloseReason::PeerClosed));
        assert_eq!(metrics.live_connections(), 0);
        assert_eq!(metrics.read_latency().count(), 1);
        assert_eq!(metrics.write_latency().count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_path_keeps_connection() {
        let (server, _metrics) = server(ServerConfig::default());
        let (mut client, stream) = tokio::io::duplex(4096);
        tokio::spawn(async move { Connection::new("test", server, stream).serve().await });

        send(&mut client, "/missing", b"").await;
        let (header, envelope) = recv(&mut client).await;
        assert_eq!(header.code, Status::InvalidPath.code());
        assert_eq!(envelope, ResponseEnvelope::Err("invalid path".to_string()));

        send(&mut client, "/echo", b"again").await;
        let (_, envelope) = recv(&mut client).await;
        assert_eq!(envelope, ResponseEnvelope::Ok(Bytes::from_static(b"again")));
    }

    #[tokio::test]
    async fn test_handler_panic_reported_as_internal_error() {
        let (server, _metrics) = server(ServerConfig::default());
        let (mut client, stream) = tokio::io::duplex(4096);
        tokio::spawn(async move { Connection::new("test", server, stream).serve().await });

        send(&mut client, "/panic", b"").await;
        let (header, envelope) = recv(&mut client).await;
        assert_eq!(header.code, Status::Internal.code());
        assert_eq!(envelope, ResponseEnvelope::Err("internal error".to_string()));

        // Connection survives the panic
        send(&mut client, "/echo", b"ok").await;
        let (_, envelope) = recv(&mut client).await;
        assert_eq!(envelope, ResponseEnvelope::Ok(Bytes::from_static(b"ok")));
    }

    #[tokio::test]
    async fn test_code_panic_closes_connection() {
        let mut registry = CodeRegistry::new();
        registry.register(1, |_, _| panic!("boom"));
        let server = Server::new(ServerConfig::default(), CodeDispatch::new(registry));
        let (mut client, stream) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { Connection::new("test", server, stream).serve().await });

        client.write_all(&Header::new(1, 0).encode()).await.unwrap();
        let reason = task.await.unwrap();
        assert!(matches!(reason, CloseReason::HandlerPanic));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_keep_alive_disabled_closes_after_one_exchange() {
        let config = ServerConfig {
            keep_alive: false,
            ..ServerConfig::default()
        };
        let (server, metrics) = server(config);
        let (mut client, stream) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { Connection::new("test", server, stream).serve().await });

        send(&mut client, "/echo", b"one").await;
        send(&mut client, "/echo", b"two").await;

        let (_, envelope) = recv(&mut client).await;
        assert_eq!(envelope, ResponseEnvelope::Ok(Bytes::from_static(b"one")));

        let reason = task.await.unwrap();
        assert!(matches!(reason, CloseReason::KeepAliveDisabled));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(metrics.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_malformed_header_closes() {
        let (server, _metrics) = server(ServerConfig::default());
        let (mut client, stream) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { Connection::new("test", server, stream).serve().await });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let reason = task.await.unwrap();
        assert!(matches!(
            reason,
            CloseReason::Read(FrameError::MalformedHeader { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes() {
        let config = ServerConfig {
            idle_timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        };
        let (server, _metrics) = server(config);
        let (_client, stream) = tokio::io::duplex(4096);

        let started = Instant::now();
        let reason = Connection::new("test", server, stream).serve().await;
        assert!(matches!(reason, CloseReason::IdleTimeout));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_idle_window() {
        let config = ServerConfig {
            idle_timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        };
        let (server, _metrics) = server(config);
        let (mut client, stream) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { Connection::new("test", server, stream).serve().await });

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(4)).await;
            send(&mut client, "/echo", b"tick").await;
            let (_, envelope) = recv(&mut client).await;
            assert_eq!(envelope, ResponseEnvelope::Ok(Bytes::from_static(b"tick")));
        }
        assert!(!task.is_finished());

        let reason = task.await.unwrap();
        assert!(matches!(reason, CloseReason::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_request_hits_read_timeout() {
        let config = ServerConfig {
            read_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            ..ServerConfig::default()
        };
        let (server, _metrics) = server(config);
        let (mut client, stream) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { Connection::new("test", server, stream).serve().await });

        client.write_all(&Header::new(0, 8).encode()).await.unwrap();
        client.write_all(b"half").await.unwrap();

        let reason = task.await.unwrap();
        assert!(matches!(reason, CloseReason::Read(FrameError::Timeout)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, metrics) = server(ServerConfig::default());
        let (_client, stream) = tokio::io::duplex(64);
        let mut conn = Connection::new("test", Arc::clone(&server), stream);
        assert_eq!(metrics.live_connections(), 1);

        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(matches!(conn.serve().await, CloseReason::AlreadyClosed));
        drop(conn);

        assert_eq!(metrics.live_connections(), 0);
        assert_eq!(server.pool().available(), 2);
    }

    #[tokio::test]
    async fn test_drop_releases_resources() {
        let (server, metrics) = server(ServerConfig::default());
        let (_client, stream) = tokio::io::duplex(64);
        let conn = Connection::new("test", Arc::clone(&server), stream);
        assert_eq!(conn.name(), "test");
        drop(conn);

        assert_eq!(metrics.live_connections(), 0);
        assert_eq!(server.pool().available(), 2);
    }
}
