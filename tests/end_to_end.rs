//! 端到端集成测试
//!
//! 在回环地址上启动完整服务端（axum 宿主 + Hub 协议栈），
//! 用真实客户端跨三种传输验证协议行为

use std::net::SocketAddr;
use std::time::Duration;

use flare_hub::config::{ClientConfig, ServerConfig};
use flare_hub::hub::MethodRegistry;
use flare_hub::server::HubServer;
use flare_hub::transport::TransportKind;
use flare_hub::{HubClient, HubError};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use url::Url;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// 测试用方法注册表
fn test_methods() -> MethodRegistry {
    MethodRegistry::new()
        .unary("Echo", |args, _ctx| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
        .unary("Slow", |args, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
        .unary("Fail", |_args, _ctx| async move {
            Err(HubError::invocation("the hub method blew up"))
        })
        .streaming("Counter", |args, _ctx| {
            let count = args
                .first()
                .and_then(Value::as_u64)
                .unwrap_or(0);
            futures::stream::iter((0..count).map(|n| Ok(json!(n))))
        })
        .streaming("Endless", |_args, ctx| {
            futures::stream::unfold((0u64, ctx), |(n, ctx)| async move {
                if ctx.abort.is_cancelled() {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                Some((Ok(json!(n)), (n + 1, ctx)))
            })
        })
}

async fn start_server(config: ServerConfig) -> (HubServer, SocketAddr) {
    start_server_with(test_methods(), config).await
}

async fn start_server_with(
    methods: MethodRegistry,
    config: ServerConfig,
) -> (HubServer, SocketAddr) {
    init_tracing();
    let server = HubServer::builder()
        .methods(methods)
        .config(config)
        .build();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let app = server.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (server, addr)
}

fn base_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("http://{addr}/")).expect("url")
}

fn detailed_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.hub.detailed_errors = true;
    config
}

/// 测试：WebSocket 直连（跳过协商），Echo 往返
#[tokio::test(flavor = "multi_thread")]
async fn test_websocket_echo() {
    let (_server, addr) = start_server(ServerConfig::default()).await;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::WebSockets),
        ClientConfig::default(),
    );
    client.start().await.expect("start");

    let result = client
        .invoke("Echo", vec![json!("hello")])
        .await
        .expect("invoke");
    assert_eq!(result, json!("hello"));

    client.stop().await;
}

/// 测试：经过协商的 SSE 传输，Echo 往返
#[tokio::test(flavor = "multi_thread")]
async fn test_sse_echo() {
    let (_server, addr) = start_server(ServerConfig::default()).await;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::ServerSentEvents),
        ClientConfig::default(),
    );
    client.start().await.expect("start");

    let result = client
        .invoke("Echo", vec![json!("over sse")])
        .await
        .expect("invoke");
    assert_eq!(result, json!("over sse"));

    client.stop().await;
}

/// 测试：经过协商的长轮询传输，Echo 往返
#[tokio::test(flavor = "multi_thread")]
async fn test_long_polling_echo() {
    let mut config = ServerConfig::default();
    config.poll_wait_secs = 5;
    let (_server, addr) = start_server(config).await;

    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::LongPolling),
        ClientConfig::default(),
    );
    client.start().await.expect("start");

    let result = client
        .invoke("Echo", vec![json!("over long polling")])
        .await
        .expect("invoke");
    assert_eq!(result, json!("over long polling"));

    client.stop().await;
}

/// 测试：两个背靠背一元调用严格按到达顺序执行并按序回 Completion
#[tokio::test(flavor = "multi_thread")]
async fn test_invocation_ordering() {
    // 每个处理器在结束时取一个序号：只有按到达顺序串行执行，
    // 先到的慢调用才会拿到更小的序号
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
    let first_counter = counter.clone();
    let second_counter = counter.clone();
    let methods = MethodRegistry::new()
        .unary("First", move |_args, _ctx| {
            let counter = first_counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!(counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst)))
            }
        })
        .unary("Second", move |_args, _ctx| {
            let counter = second_counter.clone();
            async move { Ok(json!(counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst))) }
        });

    let (_server, addr) = start_server_with(methods, ServerConfig::default()).await;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::WebSockets),
        ClientConfig::default(),
    );
    client.start().await.expect("start");

    let first_client = client.clone();
    let first = tokio::spawn(async move { first_client.invoke("First", vec![]).await });
    // 确保 First 先到达服务端
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second_client = client.clone();
    let second = tokio::spawn(async move { second_client.invoke("Second", vec![]).await });

    let first_result = first.await.expect("join").expect("first ok");
    let second_result = second.await.expect("join").expect("second ok");
    assert_eq!(first_result, json!(0));
    assert_eq!(second_result, json!(1));

    client.stop().await;
}

/// 测试：未知方法返回约定的错误文案，连接保持存活
///
/// 该用例走完整协商路径（不显式指定传输，按服务端顺序选中 WebSockets）
#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_method() {
    let (_server, addr) = start_server(ServerConfig::default()).await;
    let client = HubClient::new(base_url(addr), ClientConfig::default());
    client.start().await.expect("start");

    let err = client
        .invoke("Missing", vec![])
        .await
        .expect_err("unknown method must fail");
    assert_eq!(err.to_string(), "Unknown hub method 'Missing'");

    // 连接未受影响
    let result = client.invoke("Echo", vec![json!(1)]).await.expect("invoke");
    assert_eq!(result, json!(1));

    client.stop().await;
}

/// 测试：方法抛错按调用恢复；开启详细错误时返回原始文案
#[tokio::test(flavor = "multi_thread")]
async fn test_invocation_error_recovery() {
    let (_server, addr) = start_server(detailed_config()).await;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::WebSockets),
        ClientConfig::default(),
    );
    client.start().await.expect("start");

    let err = client.invoke("Fail", vec![]).await.expect_err("must fail");
    assert_eq!(err.to_string(), "the hub method blew up");

    let result = client.invoke("Echo", vec![json!(2)]).await.expect("invoke");
    assert_eq!(result, json!(2));

    client.stop().await;
}

/// 测试：流式调用逐项送达后正常结束
#[tokio::test(flavor = "multi_thread")]
async fn test_stream_invocation() {
    let (_server, addr) = start_server(ServerConfig::default()).await;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::WebSockets),
        ClientConfig::default(),
    );
    client.start().await.expect("start");

    let (_id, mut stream) = client
        .stream("Counter", vec![json!(3)])
        .await
        .expect("stream");

    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(assert_ok!(item));
    }
    assert_eq!(items, vec![json!(0), json!(1), json!(2)]);

    client.stop().await;
}

/// 测试：取消在途流式调用后流收尾，后续调用不受影响
#[tokio::test(flavor = "multi_thread")]
async fn test_stream_cancellation() {
    let (_server, addr) = start_server(ServerConfig::default()).await;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::WebSockets),
        ClientConfig::default(),
    );
    client.start().await.expect("start");

    let (id, mut stream) = client.stream("Endless", vec![]).await.expect("stream");
    // 收到至少一项后取消
    let first = stream.next().await.expect("first item").expect("ok");
    assert_eq!(first, json!(0));
    client.cancel(&id).await.expect("cancel");

    // 服务端收尾后流关闭（Completion 不携带错误）
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(item) = stream.next().await {
            item.expect("no error after cancel");
        }
    })
    .await;
    assert!(drained.is_ok(), "stream should close after cancellation");

    let result = client.invoke("Echo", vec![json!(3)]).await.expect("invoke");
    assert_eq!(result, json!(3));

    client.stop().await;
}

/// 测试：对没有活跃流的 invocation id 发送取消是无害的空操作
#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_is_idempotent() {
    let (_server, addr) = start_server(ServerConfig::default()).await;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::WebSockets),
        ClientConfig::default(),
    );
    client.start().await.expect("start");

    client.cancel("999").await.expect("cancel unknown id");
    client.cancel("999").await.expect("cancel twice");

    // 连接依然可用
    let result = client.invoke("Echo", vec![json!("alive")]).await.expect("invoke");
    assert_eq!(result, json!("alive"));

    client.stop().await;
}

/// 测试：Completion 到达前停止连接，在途调用以约定文案失败
#[tokio::test(flavor = "multi_thread")]
async fn test_pending_invocation_cleanup_on_stop() {
    let (_server, addr) = start_server(ServerConfig::default()).await;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::WebSockets),
        ClientConfig::default(),
    );
    client.start().await.expect("start");

    let invoke_client = client.clone();
    let pending = tokio::spawn(async move { invoke_client.invoke("Slow", vec![json!(1)]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.stop().await;

    let err = pending.await.expect("join").expect_err("must fail");
    assert_eq!(
        err.to_string(),
        "Invocation canceled due to connection being closed."
    );
}

/// 测试：服务端终止长轮询连接，下一次轮询收到 204，关闭回调无错误
#[tokio::test(flavor = "multi_thread")]
async fn test_long_polling_204_termination() {
    let mut config = ServerConfig::default();
    config.poll_wait_secs = 5;
    let (server, addr) = start_server(config).await;

    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::LongPolling),
        ClientConfig::default(),
    );
    let (close_tx, mut close_rx) = mpsc::channel::<Option<String>>(1);
    client.set_on_close(Box::new(move |error| {
        let _ = close_tx.try_send(error.map(|e| e.to_string()));
    }));
    client.start().await.expect("start");

    // 服务端主动拆除全部连接
    server.shutdown().await;

    let closed = tokio::time::timeout(Duration::from_secs(10), close_rx.recv())
        .await
        .expect("close callback fired")
        .expect("channel open");
    assert!(closed.is_none(), "204 termination is not an error, got {closed:?}");
}

/// 测试：保活注入让空闲连接存活；静默超过超时阈值时以约定文案关闭
#[tokio::test(flavor = "multi_thread")]
async fn test_keep_alive_liveness_and_timeout() {
    // 服务端每秒注入 Ping，客户端超时 3 秒：空闲连接必须存活
    let mut lively = ServerConfig::default();
    lively.hub.keep_alive_interval_secs = 1;
    let (_server, addr) = start_server(lively).await;

    let mut client_config = ClientConfig::default();
    client_config.hub.client_timeout_secs = 3;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::WebSockets),
        client_config,
    );
    client.start().await.expect("start");
    tokio::time::sleep(Duration::from_secs(4)).await;
    let result = client.invoke("Echo", vec![json!("still here")]).await.expect("invoke");
    assert_eq!(result, json!("still here"));
    client.stop().await;

    // 服务端保持静默（保活间隔拉长到远超客户端超时）：客户端必须按约定文案关闭
    let mut silent = ServerConfig::default();
    silent.hub.keep_alive_interval_secs = 600;
    let (_server, addr) = start_server(silent).await;

    let mut client_config = ClientConfig::default();
    client_config.hub.client_timeout_secs = 1;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::WebSockets),
        client_config,
    );
    let (close_tx, mut close_rx) = mpsc::channel::<Option<String>>(1);
    client.set_on_close(Box::new(move |error| {
        let _ = close_tx.try_send(error.map(|e| e.to_string()));
    }));
    client.start().await.expect("start");

    let closed = tokio::time::timeout(Duration::from_secs(10), close_rx.recv())
        .await
        .expect("close callback fired")
        .expect("channel open");
    assert_eq!(
        closed.as_deref(),
        Some("Server timeout elapsed without receiving a message from the server.")
    );
}

/// 测试：服务端广播到全部连接，客户端注册的处理器被调用
#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_to_all() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    let client = HubClient::with_transport(
        base_url(addr),
        Some(TransportKind::WebSockets),
        ClientConfig::default(),
    );

    let (seen_tx, mut seen_rx) = mpsc::channel::<Vec<Value>>(1);
    client.on("NewsUpdate", move |args| {
        let _ = seen_tx.try_send(args);
    });
    client.start().await.expect("start");

    // 等注册表收录该连接后广播
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection registered");

    server
        .clients()
        .all()
        .invoke("NewsUpdate", vec![json!("breaking")])
        .await
        .expect("broadcast");

    let args = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("handler invoked")
        .expect("channel open");
    assert_eq!(args, vec![json!("breaking")]);

    client.stop().await;
}
