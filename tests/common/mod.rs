#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use qstream::config::AppConfig;
use qstream::context::AppContext;
use qstream::core::CallTracker;
use qstream::core::engine::{ExecutionHandle, QueryEngine, QueryRequest};
use qstream::rpc::protocol::ServerMessage;
use qstream::rpc::{RpcServer, ServerError};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Engine driven by the query text:
///
/// - `stream N`: N progress chunks `chunk-1..N`, then payload `done`
/// - `stall`: one chunk `first`, then waits until cancelled
/// - `fail`: one chunk `partial`, then fails with `boom`
/// - anything else: echoed back as the payload
#[derive(Default)]
pub struct ScriptedEngine {
    pub submitted: AtomicUsize,
    pub cancelled: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl QueryEngine for ScriptedEngine {
    fn submit(&self, request: &QueryRequest) -> anyhow::Result<ExecutionHandle> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let query = request.query.trim().to_string();
        let cancelled = self.cancelled.clone();

        Ok(ExecutionHandle::spawn(move |channel, cancel| async move {
            if let Some(count) = query.strip_prefix("stream ") {
                let count: usize = count.parse()?;
                for i in 1..=count {
                    channel.push(format!("chunk-{i}"));
                }
                return anyhow::Ok("done".to_string());
            }
            match query.as_str() {
                "stall" => {
                    channel.push("first");
                    cancel.cancelled().await;
                    cancelled.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("Query was cancelled")
                }
                "fail" => {
                    channel.push("partial");
                    anyhow::bail!("boom")
                }
                _ => anyhow::Ok(query),
            }
        }))
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        shutdown_grace_secs: 1,
        ..AppConfig::default()
    }
}

pub struct TestServer {
    pub server: Arc<RpcServer>,
    pub addr: SocketAddr,
    pub tracker: CallTracker,
    pub handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    /// Idle calls the server keeps registered when nothing is running.
    pub fn idle_calls(&self) -> usize {
        let config = &self.server.services().ctx.config;
        config.acceptors * qstream::core::Procedure::ALL.len()
    }

    /// Wait until only idle calls are alive.
    pub async fn settled(&self) {
        let idle = self.idle_calls();
        eventually(|| self.tracker.live() == idle).await;
    }

    pub async fn stop(self) -> Result<(), ServerError> {
        self.server.shutdown();
        timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("timeout waiting for shutdown")
            .expect("server task panicked")
    }
}

pub async fn start(ctx: AppContext) -> TestServer {
    let tracker = ctx.tracker.clone();
    let server = Arc::new(
        RpcServer::bind(ctx, SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind"),
    );
    let addr = server.local_addr().expect("local addr");

    let running = server.clone();
    let handle = tokio::spawn(async move { running.start().await });

    let server = TestServer {
        server,
        addr,
        tracker,
        handle,
    };
    server.settled().await;
    server
}

pub async fn start_scripted(engine: Arc<ScriptedEngine>) -> TestServer {
    start(AppContext::with_engine(test_config(), engine)).await
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually(check: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Line-level client for interleaved calls on one connection.
pub struct RawClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("write");
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
    }

    pub async fn call(&mut self, id: u64, method: &str, params: Value) {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        self.send_raw(&request.to_string()).await;
    }

    pub async fn query(&mut self, id: u64, query: &str) {
        self.call(id, "query", serde_json::json!({ "query": query })).await;
    }

    pub async fn next(&mut self) -> ServerMessage {
        let line = timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timeout waiting for message")
            .expect("read")
            .expect("connection closed");
        serde_json::from_str(&line).expect("server message")
    }

    /// Whether the server closed the connection within a few seconds.
    pub async fn closed(&mut self) -> bool {
        matches!(
            timeout(Duration::from_secs(5), self.lines.next_line()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }
}
