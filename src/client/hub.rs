//! Hub 客户端
//!
//! 在逻辑连接之上提供方法调用语义：一元调用（等待 Completion）、
//! fire-and-forget 发送、流式调用（增量接收 StreamItem）与取消。
//! 在途调用按 invocation id 记录在并发 map 中；连接关闭时全部在途调用
//! 以约定文案（或触发关闭的错误文案）收到失败

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use url::Url;

use crate::client::connection::{HttpConnection, OnClose};
use crate::config::ClientConfig;
use crate::error::{ERR_INVOCATION_CANCELED, ERR_SERVER_TIMEOUT, HubError, Result};
use crate::hub::keepalive::ReceiveClock;
use crate::protocol::handshake::{self, HandshakeRequest};
use crate::protocol::message::HubMessage;
use crate::protocol::{HubProtocol, JsonHubProtocol};
use crate::transport::{TransportEvent, TransportKind};

/// 服务端主动调用的客户端处理器
type OnHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

enum PendingCall {
    /// 一元调用：等待 Completion 的一次性唤醒
    Invoke(oneshot::Sender<Result<Value>>),
    /// 流式调用：StreamItem 逐个投递，Completion 结束
    Stream(mpsc::Sender<Result<Value>>),
}

struct HubClientInner {
    config: ClientConfig,
    protocol: Arc<dyn HubProtocol>,
    connection: HttpConnection,
    pending: DashMap<String, PendingCall>,
    handlers: DashMap<String, OnHandler>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HubClientInner {
    fn next_invocation_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn send_message(&self, message: &HubMessage) -> Result<()> {
        let encoded = self.protocol.encode(message)?;
        self.connection.send(encoded).await
    }

    /// 关闭连接并以触发错误（或约定的取消文案）了结全部在途调用
    async fn close(&self, error: Option<HubError>) {
        let text = error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| ERR_INVOCATION_CANCELED.to_string());

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                match call {
                    PendingCall::Invoke(tx) => {
                        let _ = tx.send(Err(HubError::Invocation(text.clone())));
                    }
                    PendingCall::Stream(tx) => {
                        let _ = tx.send(Err(HubError::Invocation(text.clone()))).await;
                    }
                }
            }
        }

        self.connection.stop(error).await;
    }

    async fn handle_message(&self, message: HubMessage) -> Option<Option<HubError>> {
        match message {
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                match self.pending.remove(&invocation_id) {
                    Some((_, PendingCall::Invoke(tx))) => {
                        let outcome = match error {
                            Some(error) => Err(HubError::Invocation(error)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    Some((_, PendingCall::Stream(tx))) => {
                        if let Some(error) = error {
                            let _ = tx.send(Err(HubError::Invocation(error))).await;
                        }
                        // sender 丢弃即流结束
                    }
                    None => {
                        debug!(invocation_id = %invocation_id, "completion for unknown invocation");
                    }
                }
                None
            }

            HubMessage::StreamItem {
                invocation_id,
                item,
            } => {
                // 不跨 await 持有并发 map 的引用
                let sender = self.pending.get(&invocation_id).and_then(|entry| {
                    if let PendingCall::Stream(tx) = entry.value() {
                        Some(tx.clone())
                    } else {
                        warn!(
                            invocation_id = %invocation_id,
                            "stream item for a non-streaming invocation"
                        );
                        None
                    }
                });
                match sender {
                    Some(tx) => {
                        let _ = tx.send(Ok(item)).await;
                    }
                    None => {
                        debug!(invocation_id = %invocation_id, "stream item for unknown invocation");
                    }
                }
                None
            }

            HubMessage::Invocation {
                target, arguments, ..
            } => {
                match self.handlers.get(&target.to_lowercase()) {
                    Some(handler) => handler.value()(arguments),
                    None => {
                        debug!(target = %target, "no handler registered for server invocation")
                    }
                }
                None
            }

            HubMessage::Ping => None,

            HubMessage::Close { error, .. } => Some(error.map(|e| {
                HubError::protocol(format!(
                    "The server closed the connection with the following error: {e}"
                ))
            })),

            other => {
                warn!(kind = other.kind(), "unexpected message from server");
                None
            }
        }
    }
}

/// Hub 客户端
#[derive(Clone)]
pub struct HubClient {
    inner: Arc<HubClientInner>,
}

impl HubClient {
    /// 创建客户端，传输由协商结果决定
    pub fn new(base_url: Url, config: ClientConfig) -> Self {
        Self::with_transport(base_url, None, config)
    }

    /// 创建客户端并显式指定传输
    ///
    /// 显式指定 WebSockets 时整个协商往返都会被跳过
    pub fn with_transport(
        base_url: Url,
        transport: Option<TransportKind>,
        config: ClientConfig,
    ) -> Self {
        let connection = HttpConnection::new(base_url, transport, config.clone());
        Self {
            inner: Arc::new(HubClientInner {
                config,
                protocol: Arc::new(JsonHubProtocol),
                connection,
                pending: DashMap::new(),
                handlers: DashMap::new(),
                next_id: AtomicU64::new(1),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 注册连接关闭回调
    pub fn set_on_close(&self, callback: OnClose) {
        self.inner.connection.set_on_close(callback);
    }

    /// 注册服务端主动调用的处理器，目标名大小写不敏感
    pub fn on(&self, target: &str, handler: impl Fn(Vec<Value>) + Send + Sync + 'static) {
        self.inner
            .handlers
            .insert(target.to_lowercase(), Arc::new(handler));
    }

    /// 启动连接：协商、建立传输、完成握手并启动接收循环
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut events = inner
            .connection
            .start(inner.protocol.transfer_format())
            .await?;

        // 握手：先于一切 Hub 消息
        let request = HandshakeRequest {
            protocol: inner.protocol.name().to_string(),
            version: inner.protocol.version(),
        };
        inner.connection.send(handshake::write_request(&request)?).await?;

        let mut buf = BytesMut::new();
        let deadline = tokio::time::Instant::now() + inner.config.hub.handshake_timeout();
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(TransportEvent::Data(data)) => {
                            buf.extend_from_slice(&data);
                            match handshake::try_parse_response(&mut buf) {
                                Ok(Some(response)) => {
                                    if let Some(error) = response.error {
                                        inner.connection.stop(None).await;
                                        return Err(HubError::protocol(format!(
                                            "Handshake was rejected by the server: {error}"
                                        )));
                                    }
                                    break;
                                }
                                Ok(None) => continue,
                                Err(e) => {
                                    inner.connection.stop(None).await;
                                    return Err(e);
                                }
                            }
                        }
                        Some(TransportEvent::Closed(error)) => {
                            inner.connection.stop(None).await;
                            return Err(error.unwrap_or_else(|| {
                                HubError::transport("connection closed during handshake")
                            }));
                        }
                        None => {
                            inner.connection.stop(None).await;
                            return Err(HubError::transport("connection closed during handshake"));
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    inner.connection.stop(None).await;
                    return Err(HubError::Timeout(
                        "Handshake was canceled because it timed out.".to_string(),
                    ));
                }
            }
        }

        // 长轮询的空轮询循环本身就是活跃信号：既不需要客户端注入 Ping，
        // 也不按帧到达计算服务端静默超时（轮询失败会直接以传输错误收场）
        let inherent_keep_alive = inner.connection.inherent_keep_alive().await;
        let mut tasks = inner.tasks.lock().await;
        tasks.push(self.spawn_receive_loop(events, buf, !inherent_keep_alive));
        if !inherent_keep_alive {
            tasks.push(self.spawn_ping_loop());
        }
        Ok(())
    }

    /// 接收循环：解析入站帧、维护服务端静默超时时钟
    fn spawn_receive_loop(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut buf: BytesMut,
        enforce_timeout: bool,
    ) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut clock = ReceiveClock::new(inner.config.hub.client_timeout());
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(TransportEvent::Data(data)) => {
                                // 任何成功到达的帧都重置超时时钟，不限于 Ping
                                clock.touch();
                                buf.extend_from_slice(&data);
                                if buf.len() > inner.config.hub.max_frame_size {
                                    inner
                                        .close(Some(HubError::framing(format!(
                                            "incoming frame exceeds the maximum of {} bytes",
                                            inner.config.hub.max_frame_size
                                        ))))
                                        .await;
                                    return;
                                }
                                let messages = match inner.protocol.parse_messages(&mut buf) {
                                    Ok(messages) => messages,
                                    Err(e) => {
                                        inner.close(Some(e)).await;
                                        return;
                                    }
                                };
                                for message in messages {
                                    if let Some(close_error) = inner.handle_message(message).await {
                                        inner.close(close_error).await;
                                        return;
                                    }
                                }
                            }
                            Some(TransportEvent::Closed(error)) => {
                                inner.close(error).await;
                                return;
                            }
                            None => {
                                inner.close(None).await;
                                return;
                            }
                        }
                    }
                    _ = tokio::time::sleep_until(clock.deadline()), if enforce_timeout => {
                        inner
                            .close(Some(HubError::Timeout(ERR_SERVER_TIMEOUT.to_string())))
                            .await;
                        return;
                    }
                }
            }
        })
    }

    /// 客户端侧保活：按保活间隔注入 Ping 帧
    fn spawn_ping_loop(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.hub.keep_alive_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                if inner.send_message(&HubMessage::Ping).await.is_err() {
                    break;
                }
            }
        })
    }

    /// 一元调用：等待服务端 Completion，返回结果或服务端错误文案
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value> {
        let inner = &self.inner;
        let invocation_id = inner.next_invocation_id();
        let (tx, rx) = oneshot::channel();
        inner
            .pending
            .insert(invocation_id.clone(), PendingCall::Invoke(tx));

        let message = HubMessage::Invocation {
            invocation_id: Some(invocation_id.clone()),
            target: target.to_string(),
            arguments,
        };
        if let Err(e) = inner.send_message(&message).await {
            inner.pending.remove(&invocation_id);
            return Err(e);
        }

        rx.await
            .unwrap_or_else(|_| Err(HubError::Invocation(ERR_INVOCATION_CANCELED.to_string())))
    }

    /// fire-and-forget 发送，不携带 invocation id，不期待回复
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<()> {
        self.inner
            .send_message(&HubMessage::Invocation {
                invocation_id: None,
                target: target.to_string(),
                arguments,
            })
            .await
    }

    /// 流式调用：返回 invocation id（用于取消）和结果流
    ///
    /// 流正常结束时自然耗尽；服务端以错误终止时最后产出一个 `Err`
    pub async fn stream(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<(String, ReceiverStream<Result<Value>>)> {
        let inner = &self.inner;
        let invocation_id = inner.next_invocation_id();
        let (tx, rx) = mpsc::channel(inner.config.hub.outbound_capacity.max(8));
        inner
            .pending
            .insert(invocation_id.clone(), PendingCall::Stream(tx));

        let message = HubMessage::StreamInvocation {
            invocation_id: invocation_id.clone(),
            target: target.to_string(),
            arguments,
        };
        if let Err(e) = inner.send_message(&message).await {
            inner.pending.remove(&invocation_id);
            return Err(e);
        }
        Ok((invocation_id, ReceiverStream::new(rx)))
    }

    /// 取消一个在途流式调用
    pub async fn cancel(&self, invocation_id: &str) -> Result<()> {
        self.inner
            .send_message(&HubMessage::CancelInvocation {
                invocation_id: invocation_id.to_string(),
            })
            .await
    }

    /// 停止客户端，任何状态下调用都是安全的
    pub async fn stop(&self) {
        self.inner.close(None).await;
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_inner() -> Arc<HubClientInner> {
        let base = Url::parse("http://localhost:1/hub").expect("url");
        let config = ClientConfig::default();
        Arc::new(HubClientInner {
            config: config.clone(),
            protocol: Arc::new(JsonHubProtocol),
            connection: HttpConnection::new(base, None, config),
            pending: DashMap::new(),
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// 测试：连接关闭时在途调用以约定文案失败
    #[tokio::test]
    async fn test_close_drains_pending_with_canceled_message() {
        let inner = test_inner();
        let (tx, rx) = oneshot::channel();
        inner.pending.insert("1".to_string(), PendingCall::Invoke(tx));

        inner.close(None).await;

        let outcome = rx.await.expect("sender resolved");
        let err = outcome.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invocation canceled due to connection being closed."
        );
    }

    /// 测试：带触发错误的关闭把错误文案传给在途调用
    #[tokio::test]
    async fn test_close_propagates_trigger_error() {
        let inner = test_inner();
        let (tx, rx) = oneshot::channel();
        inner.pending.insert("1".to_string(), PendingCall::Invoke(tx));

        inner
            .close(Some(HubError::Timeout(ERR_SERVER_TIMEOUT.to_string())))
            .await;

        let err = rx.await.expect("sender resolved").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Server timeout elapsed without receiving a message from the server."
        );
    }

    /// 测试：Completion 唤醒一元调用
    #[tokio::test]
    async fn test_completion_resolves_invoke() {
        let inner = test_inner();
        let (tx, rx) = oneshot::channel();
        inner.pending.insert("7".to_string(), PendingCall::Invoke(tx));

        let close = inner
            .handle_message(HubMessage::completion("7", Some(json!("hello"))))
            .await;
        assert!(close.is_none());
        assert_eq!(rx.await.expect("resolved").expect("ok"), json!("hello"));
    }

    /// 测试：未知 invocation id 的 Completion 不影响连接
    #[tokio::test]
    async fn test_unknown_completion_is_ignored() {
        let inner = test_inner();
        let close = inner.handle_message(HubMessage::completion("404", None)).await;
        assert!(close.is_none());
    }

    /// 测试：服务端 Close 帧携带错误时转为连接关闭错误
    #[tokio::test]
    async fn test_server_close_with_error() {
        let inner = test_inner();
        let close = inner
            .handle_message(HubMessage::Close {
                error: Some("shutting down".to_string()),
                allow_reconnect: false,
            })
            .await;
        let error = close.expect("close requested").expect("with error");
        assert!(error.to_string().contains("shutting down"));
    }
}
