//! Hub 调用分发器
//!
//! 每个连接一个分发循环：把入站字节解码为 Hub 消息并执行。
//! 一元调用相对接收循环同步执行，严格按到达顺序；流式调用注册取消令牌后
//! 脱离主循环（fire-and-forget 任务），与后续消息并发。
//! 所有出站写入（主调用路径、任意数量的流式任务、保活注入）都经过
//! 同一条出站队列串行化，并发完成的处理器不会在线上交错出半截帧

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::FutureExt;
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::{ERR_SERVER_TIMEOUT, HubError, Result};
use crate::hub::clients::HubClients;
use crate::hub::keepalive::KeepAliveMonitor;
use crate::hub::methods::{
    AuthorizationEvaluator, HubActivator, HubContext, MethodHandler, MethodRegistry, Principal,
};
use crate::metrics::HubMetrics;
use crate::protocol::handshake::{self, HandshakeResponse};
use crate::protocol::message::HubMessage;
use crate::protocol::HubProtocol;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::server::connection::ServerConnection;
use crate::transport::TransportKind;
use serde_json::Value;

/// 分发器依赖的服务端共享状态，全部连接只读共享
pub struct HubState {
    pub config: HubConfig,
    pub methods: Arc<MethodRegistry>,
    pub registry: Arc<ConnectionRegistry>,
    pub clients: HubClients,
    pub activator: Arc<dyn HubActivator>,
    pub authorizer: Arc<dyn AuthorizationEvaluator>,
    pub metrics: Arc<HubMetrics>,
    /// 服务端支持的协议，按握手声明的名称索引
    pub protocols: std::collections::HashMap<&'static str, Arc<dyn HubProtocol>>,
}

/// 出站写句柄：主循环与每个流式任务各持有一份克隆，
/// 写入通过同一条 mpsc 队列串行化
#[derive(Clone)]
struct OutboundWriter {
    protocol: Arc<dyn HubProtocol>,
    tx: mpsc::Sender<Bytes>,
    metrics: Arc<HubMetrics>,
}

impl OutboundWriter {
    async fn write(&self, message: &HubMessage) -> Result<()> {
        let encoded = self.protocol.encode(message)?;
        self.metrics.messages_sent_total.inc();
        self.tx
            .send(encoded)
            .await
            .map_err(|_| HubError::transport("connection outbound queue is closed"))
    }
}

enum Flow {
    Continue,
    Stop,
}

/// 单连接的 Hub 分发器
pub struct HubDispatcher {
    state: Arc<HubState>,
    connection: Arc<ServerConnection>,
    principal: Principal,
    /// 在途流式调用的取消令牌，按 invocation id 索引
    pending_streams: Arc<DashMap<String, CancellationToken>>,
}

impl HubDispatcher {
    pub fn new(
        state: Arc<HubState>,
        connection: Arc<ServerConnection>,
        principal: Principal,
    ) -> Self {
        Self {
            state,
            connection,
            principal,
            pending_streams: Arc::new(DashMap::new()),
        }
    }

    /// 运行分发循环直到连接终结
    ///
    /// `inbound` 是传输层推入的原始字节流，`wire_tx` 是交给传输层写泵的
    /// 出站队列。握手完成后分发器在两者之间插入保活装饰泵
    pub async fn run(self, mut inbound: mpsc::Receiver<Bytes>, wire_tx: mpsc::Sender<Bytes>) {
        let connection_id = self.connection.id.clone();

        let Some((protocol, mut buf)) = self.handshake(&mut inbound, &wire_tx).await else {
            self.connection.token.cancel();
            return;
        };
        self.connection.set_transfer_format(protocol.transfer_format());
        info!(
            connection_id = %connection_id,
            protocol = protocol.name(),
            "hub connection handshake completed"
        );

        // 出站串行化队列：分发器与流式任务写这头，保活泵消费后落到线上
        let (app_tx, app_rx) = mpsc::channel::<Bytes>(self.state.config.outbound_capacity);
        self.spawn_keep_alive_pump(&protocol, app_rx, wire_tx.clone());

        let writer = OutboundWriter {
            protocol: protocol.clone(),
            tx: app_tx.clone(),
            metrics: self.state.metrics.clone(),
        };

        let handle = Arc::new(ConnectionHandle::new(
            connection_id.clone(),
            protocol.transfer_format(),
            protocol.clone(),
            app_tx,
            self.connection.token.clone(),
            self.principal.identity.clone(),
        ));
        self.state.registry.add(handle);
        self.state.metrics.connections_total.inc();
        self.state.metrics.connections_active.inc();
        if let Err(e) = self.state.activator.create(&connection_id).await {
            warn!(connection_id = %connection_id, error = %e, "hub activator rejected connection");
        }

        let client_timeout = self.state.config.client_timeout();
        let mut close_error: Option<HubError> = None;

        'main: loop {
            tokio::select! {
                biased;

                _ = self.connection.token.cancelled() => {
                    debug!(connection_id = %connection_id, "connection aborted");
                    break 'main;
                }

                incoming = inbound.recv() => {
                    let Some(data) = incoming else {
                        // 传输侧挂断
                        break 'main;
                    };
                    self.connection.touch_activity();
                    buf.extend_from_slice(&data);
                    if buf.len() > self.state.config.max_frame_size {
                        close_error = Some(HubError::framing(format!(
                            "incoming frame exceeds the maximum of {} bytes",
                            self.state.config.max_frame_size
                        )));
                        break 'main;
                    }

                    let messages = match protocol.parse_messages(&mut buf) {
                        Ok(messages) => messages,
                        Err(e) => {
                            close_error = Some(e);
                            break 'main;
                        }
                    };
                    for message in messages {
                        self.state.metrics.messages_received_total.inc();
                        match self.dispatch(message, &writer).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Stop) => break 'main,
                            Err(e) => {
                                close_error = Some(e);
                                break 'main;
                            }
                        }
                    }
                }

                _ = tokio::time::sleep_until(self.connection.last_activity() + client_timeout) => {
                    // 长轮询的空轮询也会推进活跃时刻，到点后再确认一次
                    if self.connection.last_activity().elapsed() >= client_timeout {
                        close_error = Some(HubError::Timeout(ERR_SERVER_TIMEOUT.to_string()));
                        break 'main;
                    }
                }
            }
        }

        if let Some(error) = &close_error {
            warn!(connection_id = %connection_id, error = %error, "closing hub connection");
            let _ = writer
                .write(&HubMessage::Close {
                    error: Some(error.to_string()),
                    allow_reconnect: false,
                })
                .await;
            // 给写泵一个把 Close 帧刷到线上的窗口再拆除
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        self.teardown(&connection_id, close_error).await;
    }

    /// 握手阶段：在超时窗口内等待握手请求，校验协议名与版本
    ///
    /// 成功时返回协商出的协议和可能已经到达的后续帧残留缓冲
    async fn handshake(
        &self,
        inbound: &mut mpsc::Receiver<Bytes>,
        wire_tx: &mpsc::Sender<Bytes>,
    ) -> Option<(Arc<dyn HubProtocol>, BytesMut)> {
        let deadline = tokio::time::Instant::now() + self.state.config.handshake_timeout();
        let mut buf = BytesMut::new();

        let request = loop {
            tokio::select! {
                _ = self.connection.token.cancelled() => return None,

                incoming = inbound.recv() => {
                    let data = incoming?;
                    buf.extend_from_slice(&data);
                    match handshake::try_parse_request(&mut buf) {
                        Ok(Some(request)) => break request,
                        Ok(None) => continue,
                        Err(e) => {
                            self.reject_handshake(wire_tx, e.to_string()).await;
                            return None;
                        }
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    warn!(connection_id = %self.connection.id, "handshake timed out");
                    self.reject_handshake(
                        wire_tx,
                        "Handshake was canceled because it timed out.".to_string(),
                    )
                    .await;
                    return None;
                }
            }
        };

        let Some(protocol) = self.state.protocols.get(request.protocol.as_str()) else {
            self.reject_handshake(
                wire_tx,
                format!("The protocol '{}' is not supported.", request.protocol),
            )
            .await;
            return None;
        };
        if request.version != protocol.version() {
            self.reject_handshake(
                wire_tx,
                format!(
                    "The server does not support version {} of the '{}' protocol.",
                    request.version, request.protocol
                ),
            )
            .await;
            return None;
        }

        let response = handshake::write_response(&HandshakeResponse::ok()).ok()?;
        wire_tx.send(response).await.ok()?;
        Some((protocol.clone(), buf))
    }

    async fn reject_handshake(&self, wire_tx: &mpsc::Sender<Bytes>, error: String) {
        warn!(connection_id = %self.connection.id, error = %error, "handshake rejected");
        if let Ok(frame) = handshake::write_response(&HandshakeResponse::error(error)) {
            let _ = wire_tx.send(frame).await;
        }
    }

    /// 在出站队列与传输写泵之间插入保活装饰泵
    ///
    /// 长轮询的空轮询循环天然就是保活信号，无需再注入 Ping
    fn spawn_keep_alive_pump(
        &self,
        protocol: &Arc<dyn HubProtocol>,
        app_rx: mpsc::Receiver<Bytes>,
        wire_tx: mpsc::Sender<Bytes>,
    ) {
        let ping = protocol
            .encode(&HubMessage::Ping)
            .expect("ping frame must encode");
        let inherent_keep_alive =
            self.connection.transport_kind() == Some(TransportKind::LongPolling);
        let mut monitor = KeepAliveMonitor::new(
            app_rx,
            self.state.config.keep_alive_interval(),
            ping.clone(),
            !inherent_keep_alive,
        );
        let metrics = self.state.metrics.clone();
        let token = self.connection.token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        // 拆除前把已排队的帧（典型的是 Close）转发出去
                        while let Some(frame) = monitor.try_recv() {
                            if wire_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                    frame = monitor.recv() => {
                        let Some(frame) = frame else { break };
                        if frame == ping {
                            metrics.pings_sent_total.inc();
                        }
                        if wire_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn dispatch(&self, message: HubMessage, writer: &OutboundWriter) -> Result<Flow> {
        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                self.handle_invocation(invocation_id, target, arguments, writer)
                    .await?;
                Ok(Flow::Continue)
            }

            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
            } => {
                self.handle_stream_invocation(invocation_id, target, arguments, writer)
                    .await?;
                Ok(Flow::Continue)
            }

            HubMessage::CancelInvocation { invocation_id } => {
                match self.pending_streams.get(&invocation_id) {
                    Some(token) => token.cancel(),
                    None => {
                        // 流可能已经在服务端自然完成，不是错误
                        debug!(
                            connection_id = %self.connection.id,
                            invocation_id = %invocation_id,
                            "cancel received for an unknown invocation"
                        );
                    }
                }
                Ok(Flow::Continue)
            }

            HubMessage::Ping => Ok(Flow::Continue),

            HubMessage::Close { error, .. } => {
                if let Some(error) = error {
                    debug!(connection_id = %self.connection.id, error = %error, "client sent close");
                }
                Ok(Flow::Stop)
            }

            // 本协议代际不支持客户端上行流，视为协议违例
            other => Err(HubError::protocol(format!(
                "received unsupported message type {}",
                other.kind()
            ))),
        }
    }

    async fn handle_invocation(
        &self,
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        writer: &OutboundWriter,
    ) -> Result<()> {
        let Some(descriptor) = self.state.methods.get(&target) else {
            warn!(
                connection_id = %self.connection.id,
                target = %target,
                "invocation of unknown hub method"
            );
            // 没有 invocation id 的 fire-and-forget 调用静默丢弃
            if let Some(id) = invocation_id {
                writer
                    .write(&HubMessage::completion_error(
                        id,
                        format!("Unknown hub method '{target}'"),
                    ))
                    .await?;
            }
            return Ok(());
        };

        if descriptor.is_streaming {
            if let Some(id) = invocation_id {
                writer
                    .write(&HubMessage::completion_error(
                        id,
                        format!(
                            "The client attempted to invoke the streaming '{target}' method \
                             with a non-streaming invocation."
                        ),
                    ))
                    .await?;
            }
            return Ok(());
        }

        if !self
            .state
            .authorizer
            .is_authorized(&self.principal, &descriptor.authorization)
        {
            self.state.metrics.observe_invocation("unauthorized");
            if let Some(id) = invocation_id {
                writer
                    .write(&HubMessage::completion_error(
                        id,
                        format!("Failed to invoke '{target}' because user is unauthorized"),
                    ))
                    .await?;
            }
            return Ok(());
        }

        let MethodHandler::Unary(handler) = &descriptor.handler else {
            return Err(HubError::invocation("descriptor/handler kind mismatch"));
        };
        let ctx = self.method_context();
        let outcome = std::panic::AssertUnwindSafe(handler(arguments, ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => {
                self.state.metrics.observe_invocation("ok");
                if let Some(id) = invocation_id {
                    writer
                        .write(&HubMessage::completion(id, Some(result)))
                        .await?;
                }
            }
            Ok(Err(e)) => {
                self.state.metrics.observe_invocation("error");
                if let Some(id) = invocation_id {
                    writer
                        .write(&HubMessage::completion_error(
                            id,
                            self.invocation_error_text(&target, &e),
                        ))
                        .await?;
                }
            }
            Err(_) => {
                self.state.metrics.observe_invocation("panic");
                warn!(
                    connection_id = %self.connection.id,
                    target = %target,
                    "hub method panicked"
                );
                if let Some(id) = invocation_id {
                    writer
                        .write(&HubMessage::completion_error(
                            id,
                            format!("An unexpected error occurred invoking '{target}' on the server."),
                        ))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_stream_invocation(
        &self,
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        writer: &OutboundWriter,
    ) -> Result<()> {
        let Some(descriptor) = self.state.methods.get(&target) else {
            writer
                .write(&HubMessage::completion_error(
                    invocation_id,
                    format!("Unknown hub method '{target}'"),
                ))
                .await?;
            return Ok(());
        };

        if !descriptor.is_streaming {
            writer
                .write(&HubMessage::completion_error(
                    invocation_id,
                    format!(
                        "The client attempted to invoke the non-streaming '{target}' method \
                         with a streaming invocation."
                    ),
                ))
                .await?;
            return Ok(());
        }

        if !self
            .state
            .authorizer
            .is_authorized(&self.principal, &descriptor.authorization)
        {
            self.state.metrics.observe_invocation("unauthorized");
            writer
                .write(&HubMessage::completion_error(
                    invocation_id,
                    format!("Failed to invoke '{target}' because user is unauthorized"),
                ))
                .await?;
            return Ok(());
        }

        let MethodHandler::Streaming(handler) = &descriptor.handler else {
            return Err(HubError::invocation("descriptor/handler kind mismatch"));
        };

        // 注册取消令牌后脱离主循环，后续消息与该流并发处理
        let stream_token = self.connection.token.child_token();
        self.pending_streams
            .insert(invocation_id.clone(), stream_token.clone());

        let mut ctx = self.method_context();
        ctx.abort = stream_token.clone();
        let mut stream = handler(arguments, ctx);

        let writer = writer.clone();
        let pending = self.pending_streams.clone();
        let detailed = self.state.config.detailed_errors;
        let connection_id = self.connection.id.clone();
        let metrics = self.state.metrics.clone();

        tokio::spawn(async move {
            let mut stream_error: Option<String> = None;
            let mut canceled = false;

            loop {
                tokio::select! {
                    _ = stream_token.cancelled() => {
                        canceled = true;
                        break;
                    }
                    item = stream.next() => {
                        match item {
                            Some(Ok(item)) => {
                                let message = HubMessage::StreamItem {
                                    invocation_id: invocation_id.clone(),
                                    item,
                                };
                                if writer.write(&message).await.is_err() {
                                    canceled = true;
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                stream_error = Some(if detailed {
                                    e.to_string()
                                } else {
                                    format!(
                                        "An unexpected error occurred invoking '{target}' \
                                         on the server."
                                    )
                                });
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }

            pending.remove(&invocation_id);
            metrics.observe_invocation(if stream_error.is_some() { "error" } else { "ok" });
            debug!(
                connection_id = %connection_id,
                invocation_id = %invocation_id,
                canceled,
                "stream invocation finished"
            );

            // 调用方主动取消不算异常终止，Completion 不携带错误
            let completion = match stream_error {
                Some(error) if !canceled => {
                    HubMessage::completion_error(invocation_id.clone(), error)
                }
                _ => HubMessage::completion(invocation_id.clone(), None),
            };
            let _ = writer.write(&completion).await;
        });

        Ok(())
    }

    fn method_context(&self) -> HubContext {
        HubContext::new(
            self.connection.id.clone(),
            self.connection.token.child_token(),
            self.state.clients.clone(),
            self.state.registry.clone(),
        )
    }

    fn invocation_error_text(&self, target: &str, error: &HubError) -> String {
        if self.state.config.detailed_errors {
            error.to_string()
        } else {
            format!("An unexpected error occurred invoking '{target}' on the server.")
        }
    }

    /// 连接终结清理：触发全部在途流的取消令牌，注销连接并释放 Hub 实例
    async fn teardown(&self, connection_id: &str, error: Option<HubError>) {
        for entry in self.pending_streams.iter() {
            entry.value().cancel();
        }
        self.pending_streams.clear();
        self.connection.token.cancel();

        if self.state.registry.remove(connection_id).is_some() {
            self.state.metrics.connections_active.dec();
        }
        self.state.activator.release(connection_id).await;

        match error {
            Some(error) => {
                info!(connection_id = %connection_id, error = %error, "hub connection closed")
            }
            None => info!(connection_id = %connection_id, "hub connection closed"),
        }
    }
}
