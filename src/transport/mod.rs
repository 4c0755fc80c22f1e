//! 客户端传输层
//!
//! 把三种物理通道（WebSocket / Server-Sent-Events / 长轮询）适配为统一的
//! 双工字节管道抽象。入站方向不使用回调：传输实现把收到的数据推入构造时
//! 注入的 channel，由上层连接持有接收端消费，组件之间没有可变反向引用

pub mod long_polling;
pub mod sse;
pub mod websocket;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use crate::error::{HubError, Result};

pub use long_polling::LongPollingTransport;
pub use sse::ServerSentEventsTransport;
pub use websocket::WebSocketTransport;

/// 传输格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFormat {
    Text,
    Binary,
}

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSockets,
    ServerSentEvents,
    LongPolling,
}

impl TransportKind {
    /// 协商响应中使用的传输名称
    pub fn wire_name(&self) -> &'static str {
        match self {
            TransportKind::WebSockets => "WebSockets",
            TransportKind::ServerSentEvents => "ServerSentEvents",
            TransportKind::LongPolling => "LongPolling",
        }
    }

    /// 按协商响应中的名称解析传输类型
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "WebSockets" => Some(TransportKind::WebSockets),
            "ServerSentEvents" => Some(TransportKind::ServerSentEvents),
            "LongPolling" => Some(TransportKind::LongPolling),
            _ => None,
        }
    }

    /// 该传输是否支持指定的传输格式
    pub fn supports(&self, format: TransferFormat) -> bool {
        match self {
            TransportKind::ServerSentEvents => format == TransferFormat::Text,
            _ => true,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// 传输层上行事件
#[derive(Debug)]
pub enum TransportEvent {
    /// 收到一段应用数据
    Data(Bytes),
    /// 物理通道关闭；`None` 表示正常关闭
    Closed(Option<HubError>),
}

/// 传输层事件发送端别名
pub type TransportEventSender = mpsc::Sender<TransportEvent>;

/// 向上层投递事件，与取消信号竞速
///
/// 上层正在拆除连接（触发了取消）时可能不再消费事件队列，
/// 投递必须可被取消解除阻塞，否则 stop() 会和投递互相等待。
/// 返回 false 表示应当退出收发泵
pub(crate) async fn deliver(
    events: &TransportEventSender,
    token: &tokio_util::sync::CancellationToken,
    event: TransportEvent,
) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        result = events.send(event) => result.is_ok(),
    }
}

/// 客户端传输抽象
///
/// 每个实例恰好服务一个逻辑连接的一次物理会话。`stop()` 必须幂等，
/// 并且要通过取消信号解除在途读写的阻塞，而不是留下悬挂请求
#[async_trait]
pub trait ClientTransport: Send {
    /// 传输类型
    fn kind(&self) -> TransportKind;

    /// 该传输自身是否天然提供保活
    ///
    /// 长轮询的空轮询循环本身就是活跃信号，上层可以省掉多余的 Ping 注入
    /// （多发一个 Ping 也无害）
    fn inherent_keep_alive(&self) -> bool {
        false
    }

    /// 建立物理连接并启动收发泵
    async fn connect(&mut self, url: &Url, format: TransferFormat) -> Result<()>;

    /// 发送一段应用数据
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// 停止传输，解除在途操作的阻塞；可重复调用
    async fn stop(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试：传输名称与协商响应约定一致
    #[test]
    fn test_wire_names() {
        for kind in [
            TransportKind::WebSockets,
            TransportKind::ServerSentEvents,
            TransportKind::LongPolling,
        ] {
            assert_eq!(TransportKind::from_wire_name(kind.wire_name()), Some(kind));
        }
        assert_eq!(TransportKind::from_wire_name("Carrier Pigeon"), None);
    }

    /// 测试：SSE 只支持文本格式
    #[test]
    fn test_sse_capability() {
        assert!(TransportKind::ServerSentEvents.supports(TransferFormat::Text));
        assert!(!TransportKind::ServerSentEvents.supports(TransferFormat::Binary));
        assert!(TransportKind::WebSockets.supports(TransferFormat::Binary));
        assert!(TransportKind::LongPolling.supports(TransferFormat::Binary));
    }
}
