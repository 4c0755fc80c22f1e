//! Flare Hub 错误类型模块
//!
//! 按照错误的作用范围划分错误分类：
//! - 单个调用范围内的错误（Invocation / Authorization）通过 Completion 帧上报，连接保持存活
//! - 帧格式 / 协议完整性错误（Framing / Protocol）对整个连接是致命的
//! - 传输层错误通过连接关闭回调对外暴露

use thiserror::Error;

/// 连接被关闭时，未完成调用统一收到的错误信息
pub const ERR_INVOCATION_CANCELED: &str = "Invocation canceled due to connection being closed.";

/// 客户端超时未收到任何服务端消息时的关闭原因
pub const ERR_SERVER_TIMEOUT: &str =
    "Server timeout elapsed without receiving a message from the server.";

/// 协商成功但没有任何可用传输时的启动失败原因
pub const ERR_NO_TRANSPORT: &str = "Unable to initialize any of the available transports.";

/// Flare Hub 统一错误类型
#[derive(Debug, Clone, Error)]
pub enum HubError {
    /// 传输层错误（网络 / socket 故障），通过关闭回调上报，内部不重试
    #[error("transport error: {0}")]
    Transport(String),

    /// 协商错误（negotiate 请求失败、传输列表非法），导致 start() 失败
    #[error("{0}")]
    Negotiation(String),

    /// 帧格式错误（帧损坏或超长），对连接致命
    #[error("framing error: {0}")]
    Framing(String),

    /// 协议违例（未知消息类型、握手不匹配），对连接致命
    #[error("{0}")]
    Protocol(String),

    /// 调用错误（Hub 方法执行失败），按调用恢复，通过 Completion.error 上报
    #[error("{0}")]
    Invocation(String),

    /// 鉴权拒绝，通过 Completion.error 上报，不致命
    #[error("{0}")]
    Authorization(String),

    /// 保活超时，对连接致命
    #[error("{0}")]
    Timeout(String),

    /// 连接状态机拒绝了当前操作
    #[error("invalid connection state: {0}")]
    InvalidState(String),

    /// HTTP 请求返回了非预期状态码
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

impl HubError {
    /// 构造传输层错误
    pub fn transport(message: impl Into<String>) -> Self {
        HubError::Transport(message.into())
    }

    /// 构造协议违例错误
    pub fn protocol(message: impl Into<String>) -> Self {
        HubError::Protocol(message.into())
    }

    /// 构造帧格式错误
    pub fn framing(message: impl Into<String>) -> Self {
        HubError::Framing(message.into())
    }

    /// 构造调用错误
    pub fn invocation(message: impl Into<String>) -> Self {
        HubError::Invocation(message.into())
    }

    /// 错误是否对整个连接致命
    ///
    /// 致命错误会拆除连接；非致命错误只影响单个调用
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HubError::Transport(_)
                | HubError::Framing(_)
                | HubError::Protocol(_)
                | HubError::Timeout(_)
        )
    }
}

/// Flare Hub 统一 Result 别名
pub type Result<T> = std::result::Result<T, HubError>;
