//! 服务端连接
//!
//! 每个逻辑连接持有一对方向独立的 channel：传输端点把收到的原始载荷推入
//! 入站队列（由分发器消费），分发器侧的出站队列由传输端点的写泵排空。
//! 组件之间只通过 channel 交接，没有互相持有的可变回调引用

use std::sync::{Mutex as StdMutex, OnceLock};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, Result};
use crate::transport::{TransferFormat, TransportKind};

/// 服务端侧的单个逻辑连接
pub struct ServerConnection {
    /// 连接 ID，协商时分配，生命周期内不变
    pub id: String,
    /// 入站队列发送端，传输端点把客户端载荷推到这里
    pub inbound_tx: mpsc::Sender<Bytes>,
    /// 线上出站队列接收端，由传输写泵独占消费
    ///
    /// 长轮询的每个 GET 请求轮流持锁消费，WebSocket / SSE 的写泵
    /// 在连接存续期间一直持锁
    pub wire_rx: Mutex<mpsc::Receiver<Bytes>>,
    /// 连接级取消信号：任何一侧触发都会拆除两个方向的泵
    pub token: CancellationToken,
    transport_kind: OnceLock<TransportKind>,
    transfer_format: OnceLock<TransferFormat>,
    /// 最近一次观测到对端活跃的时刻
    ///
    /// 除入站帧之外，长轮询的空轮询请求也计入活跃，
    /// 静默超时以此为准而不是只看帧到达
    last_activity: StdMutex<Instant>,
}

impl ServerConnection {
    pub fn new(
        id: String,
        inbound_tx: mpsc::Sender<Bytes>,
        wire_rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            id,
            inbound_tx,
            wire_rx: Mutex::new(wire_rx),
            token: CancellationToken::new(),
            transport_kind: OnceLock::new(),
            transfer_format: OnceLock::new(),
            last_activity: StdMutex::new(Instant::now()),
        }
    }

    /// 记录一次对端活跃
    pub fn touch_activity(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    /// 最近一次对端活跃时刻
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("activity lock poisoned")
    }

    /// 物理传输首次挂接时记录传输类型
    ///
    /// 一个连接只允许绑定一种传输；重复挂接不同传输是客户端错误
    pub fn attach_transport(&self, kind: TransportKind) -> Result<()> {
        match self.transport_kind.get() {
            None => {
                let _ = self.transport_kind.set(kind);
                Ok(())
            }
            Some(existing) if *existing == kind => Ok(()),
            Some(existing) => Err(HubError::InvalidState(format!(
                "connection is already bound to the '{existing}' transport"
            ))),
        }
    }

    /// 已挂接的传输类型
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.transport_kind.get().copied()
    }

    /// 握手完成后记录协商出的传输格式
    pub fn set_transfer_format(&self, format: TransferFormat) {
        let _ = self.transfer_format.set(format);
    }

    /// 协商出的传输格式；握手完成前默认按文本处理
    pub fn transfer_format(&self) -> TransferFormat {
        self.transfer_format
            .get()
            .copied()
            .unwrap_or(TransferFormat::Text)
    }
}
