//! Integration tests for the TCP server.
//!
//! Each test binds a real listener on 127.0.0.1:0 and talks to it through
//! the client.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use vsock_serve::handler::{CodeRegistry, PathRegistry};
use vsock_serve::metrics::{Metrics, ServerMetrics};
use vsock_serve::runtime::{CodeDispatch, Dispatch, PathDispatch};
use vsock_serve::server::{bind, Server, ServerConfig};
use vsock_serve::{Client, ClientError, Status};

struct TestServer {
    addr: SocketAddr,
    metrics: Arc<ServerMetrics>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<io::Result<()>>,
}

impl TestServer {
    async fn start(config: ServerConfig, dispatch: impl Dispatch) -> Self {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(ServerMetrics::new());
        let server = Server::with_metrics(
            config,
            dispatch,
            Arc::clone(&metrics) as Arc<dyn Metrics>,
        );

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(listener, async {
            let _ = rx.await;
        }));

        TestServer {
            addr,
            metrics,
            shutdown: Some(tx),
            handle,
        }
    }

    async fn client(&self) -> Client<tokio::net::TcpStream> {
        Client::connect(self.addr)
            .await
            .unwrap()
            .with_timeout(Duration::from_secs(5))
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.unwrap().unwrap();
    }

    /// Wait until every connection has been released.
    async fn wait_idle(&self) {
        for _ in 0..500 {
            if self.metrics.live_connections() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connections still open: {}", self.metrics.live_connections());
    }
}

fn path_registry() -> PathRegistry {
    let mut registry = PathRegistry::new();
    registry
        .register("/echo", |req| Ok(req.to_vec()))
        .register("/error", |_| Err("bad input".into()))
        .register("/panic", |_| panic!("handler exploded"))
        .register("/huge", |_| Ok(vec![7u8; 70_000]));
    registry
}

async fn path_server(config: ServerConfig) -> TestServer {
    TestServer::start(config, PathDispatch::new(path_registry())).await
}

#[tokio::test]
async fn test_echo_over_tcp() {
    let server = path_server(ServerConfig::default()).await;
    let mut client = server.client().await;

    for i in 0..10 {
        let payload = format!("message {i}");
        let rsp = client.call("/echo", payload.clone()).await.unwrap();
        assert_eq!(rsp, Bytes::from(payload));
    }

    // Empty request bodies are valid
    let rsp = client.call("/echo", Bytes::new()).await.unwrap();
    assert!(rsp.is_empty());

    client.close().await.unwrap();
    server.wait_idle().await;
    assert_eq!(server.metrics.total_connections(), 1);
    assert_eq!(server.metrics.read_latency().count(), 11);
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_path_then_follow_up() {
    let server = path_server(ServerConfig::default()).await;
    let mut client = server.client().await;

    let err = client.call("/missing", Bytes::new()).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidPath));

    let rsp = client.call("/echo", "still here").await.unwrap();
    assert_eq!(&rsp[..], b"still here");
    server.stop().await;
}

#[tokio::test]
async fn test_handler_error_in_envelope() {
    let server = path_server(ServerConfig::default()).await;
    let mut client = server.client().await;

    let err = client.call("/error", Bytes::new()).await.unwrap_err();
    match err {
        ClientError::Remote { code, message } => {
            assert_eq!(code, 0);
            assert_eq!(message, "bad input");
        }
        other => panic!("unexpected error: {other}"),
    }
    server.stop().await;
}

#[tokio::test]
async fn test_oversized_response_reported() {
    let server = path_server(ServerConfig::default()).await;
    let mut client = server.client().await;

    let err = client.call("/huge", Bytes::new()).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::ResponseTooLarge));

    let rsp = client.call("/echo", "after").await.unwrap();
    assert_eq!(&rsp[..], b"after");
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panic_isolation_across_connections() {
    let server = Arc::new(path_server(ServerConfig::default()).await);

    let mut tasks = Vec::new();
    for n in 0..16 {
        let mut client = server.client().await;
        tasks.push(tokio::spawn(async move {
            if n % 2 == 0 {
                let err = client.call("/panic", Bytes::new()).await.unwrap_err();
                assert_eq!(err.status(), Some(Status::Internal));
            }
            let payload = format!("client {n}");
            let rsp = client.call("/echo", payload.clone()).await.unwrap();
            assert_eq!(rsp, Bytes::from(payload));
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    server.wait_idle().await;
    assert_eq!(server.metrics.total_connections(), 16);
    let server = Arc::into_inner(server).unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_keep_alive_disabled() {
    let config = ServerConfig {
        keep_alive: false,
        ..ServerConfig::default()
    };
    let server = path_server(config).await;
    let mut client = server.client().await;

    let rsp = client.call("/echo", "once").await.unwrap();
    assert_eq!(&rsp[..], b"once");
    assert!(client.call("/echo", "twice").await.is_err());

    server.wait_idle().await;
    server.stop().await;
}

#[tokio::test]
async fn test_idle_timeout() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let server = path_server(config).await;
    let mut client = server.client().await;

    client.call("/echo", "warm").await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    server.wait_idle().await;
    assert!(client.call("/echo", "late").await.is_err());
    server.stop().await;
}

#[tokio::test]
async fn test_code_addressed_dispatch() {
    let mut registry = CodeRegistry::new();
    registry
        .register(1, |_, body| body.to_vec())
        .register(2, |code, _| format!("code {code}").into_bytes());
    let server = TestServer::start(ServerConfig::default(), CodeDispatch::new(registry)).await;
    let mut client = server.client().await;

    let (code, body) = client.call_code(1, b"abc").await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(&body[..], b"abc");

    let (code, body) = client.call_code(2, b"").await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(&body[..], b"code 2");

    let (code, body) = client.call_code(99, b"x").await.unwrap();
    assert_eq!(code, Status::InvalidAction.code());
    assert_eq!(&body[..], b"invalid action");

    // Unknown codes leave the connection usable
    let (code, body) = client.call_code(1, b"again").await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(&body[..], b"again");
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_after_current_exchange() {
    let server = path_server(ServerConfig::default()).await;
    let mut client = server.client().await;
    client.call("/echo", "before").await.unwrap();

    let addr = server.addr;
    server.stop().await;

    // The live connection answers one more request, then closes
    let rsp = client.call("/echo", "during").await.unwrap();
    assert_eq!(&rsp[..], b"during");
    assert!(client.call("/echo", "after").await.is_err());

    // The listener is gone
    assert!(Client::connect(addr).await.is_err());
}
