//! End-to-end: a server on a loopback port, driven by a raw framed client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    bytes::Bytes,
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    tokio::net::TcpStream,
};

use {
    ferry_config::{ServerConfig, load_config},
    ferry_discovery::{MemoryConnector, MemoryRegistry, RegistryKind},
    ferry_protocol::{CodecType, RequestFrame, ResponseFrame, error_codes},
    ferry_server::{
        CallContext, LifecycleState, RpcError, RpcService, Server, ServerBuilder, ServiceBuilder,
        ShutdownOutcome, Terminator,
    },
    ferry_transport::{CompressType, frame},
};

// ── Services ─────────────────────────────────────────────────────────────────

struct Arith;

impl RpcService for Arith {
    fn service(&self) -> &str {
        "arith.Arith"
    }

    fn version(&self) -> &str {
        "v1"
    }
}

#[derive(Serialize, Deserialize)]
struct Operands {
    a: i64,
    b: i64,
}

#[derive(Default)]
struct Counter {
    total: u64,
}

impl RpcService for Counter {
    fn service(&self) -> &str {
        "arith.Counter"
    }

    fn version(&self) -> &str {
        "v1"
    }
}

fn arith() -> ServiceBuilder<Arith> {
    ServiceBuilder::new(Arith)
        .method("Add", |_: &Arith, ops: Operands| async move {
            Ok::<_, RpcError>(ops.a + ops.b)
        })
        .method("Div", |_: &Arith, ops: Operands| async move {
            if ops.b == 0 {
                return Err(RpcError::new("divide by zero"));
            }
            Ok(ops.a / ops.b)
        })
        .method("Slow", |_: &Arith, ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, RpcError>(ms)
        })
        .method_ctx("Whoami", |_: &Arith, ctx: CallContext, (): ()| async move {
            Ok::<_, RpcError>(ctx.peer.map(|p| p.to_string()))
        })
        .method("Explode", |_: &Arith, (): ()| async {
            let nothing: Option<i64> = None;
            Ok::<_, RpcError>(nothing.expect("arith exploded"))
        })
}

fn counter() -> ServiceBuilder<Counter> {
    ServiceBuilder::locked(Counter::default()).method_mut("Incr", |c: &mut Counter, by: u64| {
        c.total += by;
        Ok(c.total)
    })
}

// ── Harness ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingTerminator(Mutex<Vec<i32>>);

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        self.0.lock().unwrap().push(code);
    }
}

fn write_config(dir: &tempfile::TempDir, codec: &str, compress: bool, limit: usize) -> ServerConfig {
    let path = dir.path().join("ferry.toml");
    let raw = format!(
        r#"
app_name = "arith"
host = "127.0.0.1"
ports = ["0"]
codec_type = "{codec}"
session_number = {limit}
session_timeout = "20s"
fail_fast_timeout = "2s"

[session]
compress_encoding = {compress}
session_name = "arith-rpc"
tcp_read_timeout = "200ms"

[registry]
type = "etcd"
addr = "127.0.0.1:2379"
idc = "east"
node_id = "arith"
"#
    );
    std::fs::write(&path, raw).unwrap();
    load_config(&path).unwrap()
}

struct Running {
    server: Server,
    addr: SocketAddr,
    registry: Arc<MemoryRegistry>,
    terminator: Arc<RecordingTerminator>,
}

async fn start(config: ServerConfig) -> Running {
    let registry = MemoryRegistry::new();
    let terminator = Arc::new(RecordingTerminator::default());
    let server = ServerBuilder::new(config)
        .connector(Arc::new(MemoryConnector::new(
            RegistryKind::Etcd,
            Arc::clone(&registry),
        )))
        .terminator(terminator.clone())
        .build()
        .await
        .unwrap();
    server.register(arith()).await.unwrap();
    server.register(counter()).await.unwrap();
    server.init().await.unwrap();
    let addr = server.local_addrs().await[0];
    Running {
        server,
        addr,
        registry,
        terminator,
    }
}

struct Client {
    stream: TcpStream,
    codec: CodecType,
    compress: CompressType,
}

impl Client {
    async fn connect(addr: SocketAddr, codec: CodecType, compress: CompressType) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            codec,
            compress,
        }
    }

    async fn send(&mut self, seq: u64, service: &str, method: &str, args: &impl Serialize) {
        let body = self.codec.encode(args).unwrap();
        let payload = self
            .codec
            .encode(&RequestFrame::new(seq, service, method, body))
            .unwrap();
        let payload = frame::compress(self.compress, Bytes::from(payload)).unwrap();
        frame::write_frame(&mut self.stream, &payload).await.unwrap();
    }

    async fn recv(&mut self) -> ResponseFrame {
        let payload = frame::read_frame(&mut self.stream, 1 << 20)
            .await
            .unwrap()
            .expect("server closed the session");
        let payload = frame::decompress(self.compress, payload, 1 << 20).unwrap();
        self.codec.decode(&payload).unwrap()
    }

    async fn call<R: DeserializeOwned>(
        &mut self,
        seq: u64,
        service: &str,
        method: &str,
        args: &impl Serialize,
    ) -> Result<R, (String, String)> {
        self.send(seq, service, method, args).await;
        let response = self.recv().await;
        assert_eq!(response.seq, seq);
        match response.error {
            None => Ok(self.codec.decode(&response.body).unwrap()),
            Some(err) => Err((err.code, err.message)),
        }
    }

    /// True once the server has closed its end.
    async fn is_closed(&mut self) -> bool {
        let read = tokio::time::timeout(
            Duration::from_secs(2),
            frame::read_frame(&mut self.stream, 1 << 20),
        )
        .await
        .expect("session was not closed");
        !matches!(read, Ok(Some(_)))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn json_calls_errors_and_graceful_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(write_config(&dir, "json", false, 8)).await;
    assert_eq!(running.server.state(), LifecycleState::Running);

    let published = running.registry.services();
    let keys: Vec<_> = published.iter().map(|s| s.attr.key()).collect();
    assert_eq!(keys, vec![
        "/east/arith.Arith/v1/json/provider",
        "/east/arith.Counter/v1/json/provider",
    ]);
    assert_eq!(published[0].nodes[0].id, "arith-127.0.0.1:0");

    let mut client = Client::connect(running.addr, CodecType::Json, CompressType::None).await;
    let sum: i64 = client.call(1, "Arith", "Add", &Operands { a: 2, b: 40 }).await.unwrap();
    assert_eq!(sum, 42);

    let err = client
        .call::<i64>(2, "Arith", "Div", &Operands { a: 1, b: 0 })
        .await
        .unwrap_err();
    assert_eq!(err, (error_codes::APPLICATION.to_string(), "divide by zero".to_string()));

    let err = client.call::<()>(3, "Nope", "Add", &()).await.unwrap_err();
    assert_eq!(err.0, error_codes::SERVICE_NOT_FOUND);
    let err = client.call::<()>(4, "Arith", "Mul", &()).await.unwrap_err();
    assert_eq!(err.0, error_codes::METHOD_NOT_FOUND);
    let err = client.call::<i64>(5, "Arith", "Add", &"not operands").await.unwrap_err();
    assert_eq!(err.0, error_codes::INVALID_ARGUMENT);

    let me: Option<String> = client.call(6, "Arith", "Whoami", &()).await.unwrap();
    assert_eq!(me, Some(client.stream.local_addr().unwrap().to_string()));

    assert_eq!(client.call::<u64>(7, "Counter", "Incr", &5u64).await.unwrap(), 5);
    assert_eq!(client.call::<u64>(8, "Counter", "Incr", &2u64).await.unwrap(), 7);

    // Idle past the read deadline; the session stays usable.
    tokio::time::sleep(Duration::from_millis(450)).await;
    let sum: i64 = client.call(9, "Arith", "Add", &Operands { a: 1, b: 1 }).await.unwrap();
    assert_eq!(sum, 2);

    let outcome = running.server.shutdown().await.unwrap();
    assert_eq!(outcome, ShutdownOutcome::Graceful);
    assert_eq!(running.server.state(), LifecycleState::Stopped);
    assert!(running.registry.is_empty());
    assert!(running.terminator.0.lock().unwrap().is_empty());
    assert!(client.is_closed().await);
    assert!(TcpStream::connect(running.addr).await.is_err());
}

#[tokio::test]
async fn replies_keep_request_order() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(write_config(&dir, "json", false, 8)).await;
    let mut client = Client::connect(running.addr, CodecType::Json, CompressType::None).await;

    // A slow call first must not let later replies overtake it.
    client.send(1, "Arith", "Slow", &150u64).await;
    client.send(2, "Arith", "Add", &Operands { a: 1, b: 2 }).await;
    client.send(3, "Counter", "Incr", &1u64).await;

    let seqs = [
        client.recv().await.seq,
        client.recv().await.seq,
        client.recv().await.seq,
    ];
    assert_eq!(seqs, [1, 2, 3]);
    running.server.stop().await.unwrap();
}

#[tokio::test]
async fn postcard_over_compressed_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(write_config(&dir, "postcard", true, 8)).await;
    assert_eq!(running.server.codec(), CodecType::Postcard);
    assert!(
        running
            .registry
            .services()
            .iter()
            .all(|s| s.attr.protocol == "postcard")
    );

    let mut client = Client::connect(running.addr, CodecType::Postcard, CompressType::Zip).await;
    let sum: i64 = client
        .call(11, "Arith", "Add", &Operands { a: -5, b: 3 })
        .await
        .unwrap();
    assert_eq!(sum, -2);
    assert_eq!(client.call::<u64>(12, "Counter", "Incr", &9u64).await.unwrap(), 9);

    running.server.stop().await.unwrap();
    assert!(running.registry.is_empty());
}

#[tokio::test]
async fn session_limit_refuses_extra_connections() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(write_config(&dir, "json", false, 1)).await;

    let mut first = Client::connect(running.addr, CodecType::Json, CompressType::None).await;
    let sum: i64 = first.call(1, "Arith", "Add", &Operands { a: 1, b: 1 }).await.unwrap();
    assert_eq!(sum, 2);
    assert_eq!(running.server.sessions().active(), 1);

    let mut second = Client::connect(running.addr, CodecType::Json, CompressType::None).await;
    assert!(second.is_closed().await);

    // The first session is unaffected.
    let sum: i64 = first.call(2, "Arith", "Add", &Operands { a: 2, b: 2 }).await.unwrap();
    assert_eq!(sum, 4);
    running.server.stop().await.unwrap();
}

#[tokio::test]
async fn panicking_method_keeps_the_session_slot_reusable() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(write_config(&dir, "json", false, 1)).await;

    let mut first = Client::connect(running.addr, CodecType::Json, CompressType::None).await;
    let err = first.call::<i64>(1, "Arith", "Explode", &()).await.unwrap_err();
    assert_eq!(err, (error_codes::INTERNAL.to_string(), "method panicked".to_string()));
    let sum: i64 = first.call(2, "Arith", "Add", &Operands { a: 3, b: 4 }).await.unwrap();
    assert_eq!(sum, 7);
    drop(first);

    for _ in 0..100 {
        if running.server.sessions().active() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(running.server.sessions().active(), 0);

    let mut second = Client::connect(running.addr, CodecType::Json, CompressType::None).await;
    let sum: i64 = second.call(1, "Arith", "Add", &Operands { a: 1, b: 2 }).await.unwrap();
    assert_eq!(sum, 3);
    running.server.stop().await.unwrap();
}
