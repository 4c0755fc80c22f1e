//! 连接注册表
//!
//! 服务端进程持有的显式注册表组件：记录活跃连接与组成员关系，
//! 由服务端在创建时注入给需要它的组件，不做全局单例。
//! 生命周期与服务端一致，连接增删查都走并发安全的 map

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HubError, Result};
use crate::protocol::HubProtocol;
use crate::transport::TransferFormat;

/// 注册表中的单个连接句柄
///
/// 出站发送端是连接的唯一写入口：注册表层的广播和分发器层的回复
/// 都通过它排队，由连接的写泵串行落到线上
pub struct ConnectionHandle {
    /// 连接 ID
    pub id: String,
    /// 协商出的传输格式
    pub transfer_format: TransferFormat,
    /// 该连接握手确定的 Hub 协议
    pub protocol: Arc<dyn HubProtocol>,
    /// 出站字节队列发送端
    outbound: mpsc::Sender<Bytes>,
    /// 连接级取消信号，连接拆除时触发
    pub token: CancellationToken,
    /// 鉴权得到的用户标识
    pub user_id: Option<String>,
}

impl ConnectionHandle {
    pub fn new(
        id: String,
        transfer_format: TransferFormat,
        protocol: Arc<dyn HubProtocol>,
        outbound: mpsc::Sender<Bytes>,
        token: CancellationToken,
        user_id: Option<String>,
    ) -> Self {
        Self {
            id,
            transfer_format,
            protocol,
            outbound,
            token,
            user_id,
        }
    }

    /// 把一段已编码的帧排入该连接的出站队列
    pub async fn send_raw(&self, data: Bytes) -> Result<()> {
        self.outbound
            .send(data)
            .await
            .map_err(|_| HubError::transport("connection outbound queue is closed"))
    }
}

/// 连接注册表
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<ConnectionHandle>>,
    groups: DashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接
    pub fn add(&self, handle: Arc<ConnectionHandle>) {
        debug!(connection_id = %handle.id, "connection registered");
        self.connections.insert(handle.id.clone(), handle);
    }

    /// 注销连接，同时清理其全部组成员关系
    pub fn remove(&self, connection_id: &str) -> Option<Arc<ConnectionHandle>> {
        for mut group in self.groups.iter_mut() {
            group.value_mut().remove(connection_id);
        }
        self.groups.retain(|_, members| !members.is_empty());

        let removed = self.connections.remove(connection_id).map(|(_, h)| h);
        if removed.is_some() {
            debug!(connection_id = %connection_id, "connection unregistered");
        }
        removed
    }

    /// 按连接 ID 查找
    pub fn get(&self, connection_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    /// 当前连接数
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// 全部连接句柄快照
    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// 把连接加入组
    pub fn add_to_group(&self, group: &str, connection_id: &str) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    /// 把连接移出组
    pub fn remove_from_group(&self, group: &str, connection_id: &str) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(connection_id);
        }
    }

    /// 组内连接快照
    pub fn group_connections(&self, group: &str) -> Vec<Arc<ConnectionHandle>> {
        let Some(members) = self.groups.get(group) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// 某用户的全部连接快照
    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().user_id.as_deref() == Some(user_id))
            .map(|entry| entry.value().clone())
            .collect()
    }
}
