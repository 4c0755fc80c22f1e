//! Hub 消息模型
//!
//! 协议中全部七种消息的类型化表示。编码细节（JSON 字段名、数字类型标签）
//! 由具体协议编解码器负责，这里只描述语义

use serde_json::Value;

/// 消息类型标签（线上格式中的 `type` 字段取值）
pub mod message_type {
    pub const INVOCATION: u8 = 1;
    pub const STREAM_ITEM: u8 = 2;
    pub const COMPLETION: u8 = 3;
    pub const STREAM_INVOCATION: u8 = 4;
    pub const CANCEL_INVOCATION: u8 = 5;
    pub const PING: u8 = 6;
    pub const CLOSE: u8 = 7;
}

/// Hub 协议消息
///
/// 不变式：
/// - 期待回复的 Invocation / StreamInvocation 携带非空 `invocation_id`，
///   且在同一连接的所有在途调用中唯一
/// - StreamItem / Completion 只会引用先前发出的 `invocation_id`
/// - CancelInvocation 只应引用活跃的流式调用
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// 方法调用；`invocation_id` 为 `None` 时是 fire-and-forget，不期待回复
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },

    /// 流式结果中的单个元素
    StreamItem {
        invocation_id: String,
        item: Value,
    },

    /// 调用的终结消息，`result` 与 `error` 至多一个存在
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },

    /// 流式方法调用，结果通过 StreamItem 序列增量送达
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
    },

    /// 取消一个活跃的流式调用
    CancelInvocation { invocation_id: String },

    /// 保活探测，无需回复
    Ping,

    /// 连接关闭通知，可携带错误文案
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

impl HubMessage {
    /// 构造成功的 Completion
    pub fn completion(invocation_id: impl Into<String>, result: Option<Value>) -> Self {
        HubMessage::Completion {
            invocation_id: invocation_id.into(),
            result,
            error: None,
        }
    }

    /// 构造携带错误的 Completion
    pub fn completion_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        HubMessage::Completion {
            invocation_id: invocation_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// 消息类型标签
    pub fn kind(&self) -> u8 {
        match self {
            HubMessage::Invocation { .. } => message_type::INVOCATION,
            HubMessage::StreamItem { .. } => message_type::STREAM_ITEM,
            HubMessage::Completion { .. } => message_type::COMPLETION,
            HubMessage::StreamInvocation { .. } => message_type::STREAM_INVOCATION,
            HubMessage::CancelInvocation { .. } => message_type::CANCEL_INVOCATION,
            HubMessage::Ping => message_type::PING,
            HubMessage::Close { .. } => message_type::CLOSE,
        }
    }
}

/// 预编码消息
///
/// 同一条逻辑消息面向不同协议的客户端广播时，按协议只编码一次，
/// 避免每个连接重复编码
#[derive(Debug, Clone)]
pub struct SerializedMessage {
    /// 协议名称（如 `json`）
    pub protocol: String,
    /// 含帧边界的完整线上字节
    pub data: bytes::Bytes,
}
