//! 广播代理与背板
//!
//! 每个广播范围（All / Group / User / Client）对应一个显式的代理结构，
//! 统一暴露 `invoke(target, args)`，不走运行时动态分发。
//! 代理把消息交给背板（Backplane）；默认的本地背板直接通过连接注册表
//! 扇出，跨实例扇出由外部背板实现承担

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::protocol::message::{HubMessage, SerializedMessage};
use crate::protocol::HubProtocol;
use crate::registry::ConnectionRegistry;

/// 广播范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastScope {
    /// 全部连接
    All,
    /// 指定组的成员连接
    Group(String),
    /// 指定用户的全部连接
    User(String),
    /// 单个连接
    Connection(String),
}

/// 带编码缓存的逻辑消息
///
/// 同一条消息向使用不同协议的连接扇出时按协议各编码一次
pub struct CachedMessage {
    message: HubMessage,
    cache: DashMap<&'static str, Bytes>,
}

impl CachedMessage {
    pub fn new(message: HubMessage) -> Self {
        Self {
            message,
            cache: DashMap::new(),
        }
    }

    /// 取指定协议下的编码结果，首次访问时编码并缓存
    pub fn encoded_for(&self, protocol: &dyn HubProtocol) -> Result<Bytes> {
        if let Some(cached) = self.cache.get(protocol.name()) {
            return Ok(cached.clone());
        }
        let encoded = protocol.encode(&self.message)?;
        self.cache.insert(protocol.name(), encoded.clone());
        Ok(encoded)
    }

    /// 转换为带协议名的预编码消息
    pub fn serialized_for(&self, protocol: &dyn HubProtocol) -> Result<SerializedMessage> {
        Ok(SerializedMessage {
            protocol: protocol.name().to_string(),
            data: self.encoded_for(protocol)?,
        })
    }
}

/// 背板抽象：跨连接（可能跨实例）的消息扇出
#[async_trait]
pub trait Backplane: Send + Sync {
    /// 把消息发布到指定范围
    async fn publish(&self, scope: BroadcastScope, message: Arc<CachedMessage>) -> Result<()>;
}

/// 单实例进程内背板：直接通过连接注册表扇出
pub struct LocalBackplane {
    registry: Arc<ConnectionRegistry>,
}

impl LocalBackplane {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Backplane for LocalBackplane {
    async fn publish(&self, scope: BroadcastScope, message: Arc<CachedMessage>) -> Result<()> {
        let targets = match &scope {
            BroadcastScope::All => self.registry.all(),
            BroadcastScope::Group(group) => self.registry.group_connections(group),
            BroadcastScope::User(user) => self.registry.user_connections(user),
            BroadcastScope::Connection(id) => self.registry.get(id).into_iter().collect(),
        };

        for connection in targets {
            let encoded = message.encoded_for(connection.protocol.as_ref())?;
            if let Err(e) = connection.send_raw(encoded).await {
                // 正在拆除的连接发不进去不影响其余目标
                warn!(connection_id = %connection.id, error = %e, "broadcast delivery skipped");
            }
        }
        Ok(())
    }
}

/// 单个广播范围的调用代理
#[derive(Clone)]
pub struct ClientProxy {
    scope: BroadcastScope,
    backplane: Arc<dyn Backplane>,
}

impl ClientProxy {
    /// 向该范围内的客户端发起一次调用（fire-and-forget，无 invocation id）
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<()> {
        let message = HubMessage::Invocation {
            invocation_id: None,
            target: target.to_string(),
            arguments,
        };
        self.backplane
            .publish(self.scope.clone(), Arc::new(CachedMessage::new(message)))
            .await
    }
}

/// 全部广播范围的入口
#[derive(Clone)]
pub struct HubClients {
    backplane: Arc<dyn Backplane>,
}

impl HubClients {
    pub fn new(backplane: Arc<dyn Backplane>) -> Self {
        Self { backplane }
    }

    /// 全部连接
    pub fn all(&self) -> ClientProxy {
        self.proxy(BroadcastScope::All)
    }

    /// 指定组
    pub fn group(&self, name: impl Into<String>) -> ClientProxy {
        self.proxy(BroadcastScope::Group(name.into()))
    }

    /// 指定用户
    pub fn user(&self, user_id: impl Into<String>) -> ClientProxy {
        self.proxy(BroadcastScope::User(user_id.into()))
    }

    /// 单个连接
    pub fn client(&self, connection_id: impl Into<String>) -> ClientProxy {
        self.proxy(BroadcastScope::Connection(connection_id.into()))
    }

    fn proxy(&self, scope: BroadcastScope) -> ClientProxy {
        ClientProxy {
            scope,
            backplane: self.backplane.clone(),
        }
    }
}
