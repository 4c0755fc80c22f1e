//! 客户端逻辑连接
//!
//! 拥有一个传输实例，向上暴露双工字节管道，作为生命周期管理单元。
//! 状态机单向推进：Initial → Connecting → Connected → Disconnected，
//! 可复用连接允许从 Disconnected 重新 start()

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use url::Url;

use crate::client::negotiate::{connection_url, negotiate, select_transport};
use crate::config::ClientConfig;
use crate::error::{HubError, Result};
use crate::transport::{
    ClientTransport, LongPollingTransport, ServerSentEventsTransport, TransferFormat,
    TransportEvent, TransportKind, WebSocketTransport,
};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Connecting,
    Connected,
    Disconnected,
}

/// 连接关闭回调
pub type OnClose = Box<dyn FnOnce(Option<HubError>) + Send>;

struct ActiveTransport {
    transport: Box<dyn ClientTransport>,
    connection_id: Option<String>,
    inherent_keep_alive: bool,
}

/// HTTP 逻辑连接
pub struct HttpConnection {
    config: ClientConfig,
    http: reqwest::Client,
    base_url: Url,
    requested_transport: Option<TransportKind>,
    state: StdMutex<ConnectionState>,
    /// stop() 通过该锁等待未完成的 start()，避免孤儿握手
    start_gate: Mutex<()>,
    active: Mutex<Option<ActiveTransport>>,
    reached_connected: AtomicBool,
    on_close: StdMutex<Option<OnClose>>,
}

impl HttpConnection {
    /// 创建逻辑连接；`requested_transport` 为 `None` 时由协商结果决定
    pub fn new(
        base_url: Url,
        requested_transport: Option<TransportKind>,
        config: ClientConfig,
    ) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            base_url,
            requested_transport,
            state: StdMutex::new(ConnectionState::Initial),
            start_gate: Mutex::new(()),
            active: Mutex::new(None),
            reached_connected: AtomicBool::new(false),
            on_close: StdMutex::new(None),
        }
    }

    /// 当前连接状态
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// 注册关闭回调；只在连接确实到达过 Connected 后触发一次
    pub fn set_on_close(&self, callback: OnClose) {
        *self.on_close.lock().expect("on_close lock poisoned") = Some(callback);
    }

    /// 协商出的连接 ID；显式 WebSockets 直连没有 ID
    pub async fn connection_id(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .and_then(|active| active.connection_id.clone())
    }

    /// 当前传输是否天然具备保活
    pub async fn inherent_keep_alive(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.inherent_keep_alive)
            .unwrap_or(false)
    }

    /// 启动连接
    ///
    /// 只允许从 Initial 或 Disconnected 启动；Connecting 期间的并发 start()
    /// 立即失败而不是排队。成功后返回传输层事件接收端
    pub async fn start(
        &self,
        format: TransferFormat,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                ConnectionState::Initial | ConnectionState::Disconnected => {
                    *state = ConnectionState::Connecting;
                }
                ConnectionState::Connecting => {
                    return Err(HubError::InvalidState(
                        "a start operation is already in progress".to_string(),
                    ));
                }
                ConnectionState::Connected => {
                    return Err(HubError::InvalidState(
                        "the connection is already started".to_string(),
                    ));
                }
            }
        }

        let _gate = self.start_gate.lock().await;

        match self.connect_transport(format).await {
            Ok(events) => {
                let mut state = self.state.lock().expect("state lock poisoned");
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::Connected;
                    self.reached_connected.store(true, Ordering::SeqCst);
                    Ok(events)
                } else {
                    // start 期间被 stop() 抢断
                    drop(state);
                    self.release_transport().await;
                    Err(HubError::InvalidState(
                        "the connection was stopped during start".to_string(),
                    ))
                }
            }
            Err(e) => {
                *self.state.lock().expect("state lock poisoned") = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn connect_transport(
        &self,
        format: TransferFormat,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        let (events_tx, events_rx) = mpsc::channel(self.config.hub.outbound_capacity.max(8));
        let access_token = self.config.access_token.clone();

        // 显式要求 WebSockets 时跳过协商往返，默认其可用
        let (kind, url, connection_id) =
            if self.requested_transport == Some(TransportKind::WebSockets) {
                (TransportKind::WebSockets, self.base_url.clone(), None)
            } else {
                let response =
                    negotiate(&self.http, &self.base_url, access_token.as_deref()).await?;
                let kind = select_transport(
                    self.requested_transport,
                    &response.available_transports,
                    format,
                )?;
                let url = connection_url(&self.base_url, &response.connection_id);
                (kind, url, Some(response.connection_id))
            };

        let mut transport: Box<dyn ClientTransport> = match kind {
            TransportKind::WebSockets => Box::new(WebSocketTransport::new(
                events_tx,
                self.config.hub.outbound_capacity,
            )),
            TransportKind::ServerSentEvents => Box::new(ServerSentEventsTransport::new(
                self.http.clone(),
                events_tx,
                access_token,
            )),
            TransportKind::LongPolling => Box::new(LongPollingTransport::new(
                self.http.clone(),
                events_tx,
                access_token,
                self.config.poll_request_timeout(),
            )),
        };

        transport.connect(&url, format).await?;
        info!(transport = %kind, connection_id = ?connection_id, "connection established");

        let inherent_keep_alive = transport.inherent_keep_alive();
        *self.active.lock().await = Some(ActiveTransport {
            transport,
            connection_id,
            inherent_keep_alive,
        });
        Ok(events_rx)
    }

    /// 通过当前传输发送一段数据
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let mut active = self.active.lock().await;
        match active.as_mut() {
            Some(active) => active.transport.send(data).await,
            None => Err(HubError::InvalidState(
                "the connection is not started".to_string(),
            )),
        }
    }

    /// 停止连接，任何状态下调用都是安全的
    ///
    /// 先把状态翻转为 Disconnected（晚到的数据被丢弃），再等待未完成的
    /// start()，释放传输，最后触发关闭回调（仅当连接确实到达过 Connected）
    pub async fn stop(&self, error: Option<HubError>) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == ConnectionState::Disconnected {
                debug!("stop called on an already disconnected connection");
            }
            *state = ConnectionState::Disconnected;
        }

        let _gate = self.start_gate.lock().await;
        self.release_transport().await;

        if self.reached_connected.swap(false, Ordering::SeqCst) {
            let callback = self.on_close.lock().expect("on_close lock poisoned").take();
            if let Some(callback) = callback {
                callback(error);
            }
        }
    }

    async fn release_transport(&self) {
        if let Some(mut active) = self.active.lock().await.take() {
            if let Err(e) = active.transport.stop().await {
                warn!(error = %e, "transport stop reported an error");
            }
        }
    }
}
