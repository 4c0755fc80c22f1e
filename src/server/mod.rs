//! Hub 服务端
//!
//! 组装连接注册表、方法注册表、分发器与 HTTP 端点，向宿主 HTTP 服务
//! 提供一个可挂载的 axum Router。宿主层只负责接收 socket，
//! 协议栈的生命周期（启动、连接跟踪、优雅停机）由这里管理

pub mod connection;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::hub::clients::{Backplane, HubClients, LocalBackplane};
use crate::hub::dispatcher::{HubDispatcher, HubState};
use crate::hub::methods::{
    AllowAllAuthorizer, AuthorizationEvaluator, DefaultActivator, HubActivator, MethodRegistry,
    Principal,
};
use crate::metrics::HubMetrics;
use crate::protocol::{HubProtocol, JsonHubProtocol};
use crate::registry::ConnectionRegistry;
use crate::server::connection::ServerConnection;
use crate::utils::new_connection_id;

pub use connection::ServerConnection as Connection;

pub(crate) struct ServerInner {
    pub config: ServerConfig,
    pub state: Arc<HubState>,
    /// 传输层可见的连接端点，按连接 ID 索引；
    /// Hub 层的注册表（握手完成后）在 `state.registry`
    pub endpoints: DashMap<String, Arc<ServerConnection>>,
    pub shutdown: CancellationToken,
}

/// Hub 服务端
#[derive(Clone)]
pub struct HubServer {
    inner: Arc<ServerInner>,
}

impl HubServer {
    pub fn builder() -> HubServerBuilder {
        HubServerBuilder::new()
    }

    /// 构造可挂载到宿主 HTTP 服务的路由
    pub fn router(&self) -> axum::Router {
        http::router(self.clone())
    }

    /// 广播代理入口
    pub fn clients(&self) -> HubClients {
        self.inner.state.clients.clone()
    }

    /// 连接注册表
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.inner.state.registry.clone()
    }

    /// 当前活跃的 Hub 连接数（已完成握手的）
    pub fn connection_count(&self) -> usize {
        self.inner.state.registry.len()
    }

    /// 优雅停机：通知全部连接拆除并等待排空
    pub async fn shutdown(&self) {
        info!("hub server shutting down");
        self.inner.shutdown.cancel();
        for entry in self.inner.endpoints.iter() {
            entry.value().token.cancel();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !self.inner.state.registry.is_empty() {
            if tokio::time::Instant::now() > deadline {
                warn!(
                    remaining = self.inner.state.registry.len(),
                    "shutdown timeout with connections still active"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("hub server shutdown completed");
    }

    /// 创建一个新的逻辑连接并启动其分发循环
    pub(crate) fn create_connection(&self, principal: Principal) -> Arc<ServerConnection> {
        let inner = &self.inner;
        let capacity = inner.state.config.outbound_capacity.max(8);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (wire_tx, wire_rx) = mpsc::channel(capacity);

        let connection = Arc::new(ServerConnection::new(
            new_connection_id(),
            inbound_tx,
            wire_rx,
        ));
        inner
            .endpoints
            .insert(connection.id.clone(), connection.clone());

        let dispatcher = HubDispatcher::new(inner.state.clone(), connection.clone(), principal);
        tokio::spawn(dispatcher.run(inbound_rx, wire_tx));

        // 连接拆除后从端点表摘除；保留一个宽限窗口，
        // 让两次轮询之间才到达的长轮询请求拿到 204 而不是 404
        let endpoints_token = connection.token.clone();
        let connection_id = connection.id.clone();
        let server = self.inner.clone();
        tokio::spawn(async move {
            endpoints_token.cancelled().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            server.endpoints.remove(&connection_id);
        });

        connection
    }

    pub(crate) fn endpoint(&self, connection_id: &str) -> Option<Arc<ServerConnection>> {
        self.inner
            .endpoints
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }
}

/// Hub 服务端构建器
pub struct HubServerBuilder {
    config: ServerConfig,
    methods: MethodRegistry,
    activator: Arc<dyn HubActivator>,
    authorizer: Arc<dyn AuthorizationEvaluator>,
    backplane: Option<Arc<dyn Backplane>>,
    protocols: Vec<Arc<dyn HubProtocol>>,
}

impl HubServerBuilder {
    fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            methods: MethodRegistry::new(),
            activator: Arc::new(DefaultActivator),
            authorizer: Arc::new(AllowAllAuthorizer),
            backplane: None,
            protocols: vec![Arc::new(JsonHubProtocol)],
        }
    }

    /// 覆盖服务端配置
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// 注入方法注册表
    pub fn methods(mut self, methods: MethodRegistry) -> Self {
        self.methods = methods;
        self
    }

    /// 注入 Hub 实例激活器
    pub fn activator(mut self, activator: Arc<dyn HubActivator>) -> Self {
        self.activator = activator;
        self
    }

    /// 注入鉴权评估器
    pub fn authorizer(mut self, authorizer: Arc<dyn AuthorizationEvaluator>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// 注入跨实例背板；缺省使用进程内背板
    pub fn backplane(mut self, backplane: Arc<dyn Backplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    pub fn build(self) -> HubServer {
        self.config.hub.validate();

        let registry = Arc::new(ConnectionRegistry::new());
        let backplane = self
            .backplane
            .unwrap_or_else(|| Arc::new(LocalBackplane::new(registry.clone())));
        let clients = HubClients::new(backplane);

        let mut protocols: HashMap<&'static str, Arc<dyn HubProtocol>> = HashMap::new();
        for protocol in self.protocols {
            protocols.insert(protocol.name(), protocol);
        }

        let state = Arc::new(HubState {
            config: self.config.hub.clone(),
            methods: Arc::new(self.methods),
            registry,
            clients,
            activator: self.activator,
            authorizer: self.authorizer,
            metrics: Arc::new(HubMetrics::default()),
            protocols,
        });

        HubServer {
            inner: Arc::new(ServerInner {
                config: self.config,
                state,
                endpoints: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}
