//! JSON Hub 协议编解码
//!
//! 文本传输格式，帧边界使用记录分隔符（见 framing 模块），
//! 帧体是带数字 `type` 标签的 JSON 对象

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HubError, Result};
use crate::protocol::framing::TextFraming;
use crate::protocol::message::{HubMessage, message_type};
use crate::transport::TransferFormat;

/// Hub 协议编解码器抽象
///
/// 负责把字节缓冲解析为类型化消息序列，以及反向序列化。
/// 实现必须是增量的：缓冲区内所有完整帧一次取尽，半截帧留待补齐
pub trait HubProtocol: Send + Sync {
    /// 握手时交换的协议名称
    fn name(&self) -> &'static str;

    /// 协议版本
    fn version(&self) -> i32;

    /// 该协议要求的传输格式
    fn transfer_format(&self) -> TransferFormat;

    /// 从缓冲区解析全部完整消息
    fn parse_messages(&self, buf: &mut BytesMut) -> Result<Vec<HubMessage>>;

    /// 序列化单条消息（含帧边界）追加到输出缓冲
    fn write_message(&self, message: &HubMessage, out: &mut BytesMut) -> Result<()>;

    /// 序列化单条消息为独立字节串
    fn encode(&self, message: &HubMessage) -> Result<Bytes> {
        let mut out = BytesMut::new();
        self.write_message(message, &mut out)?;
        Ok(out.freeze())
    }
}

/// 线上 JSON 对象的原始形态，所有可选字段共享一个结构
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(rename = "invocationId", skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    item: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(rename = "allowReconnect", skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

/// JSON Hub 协议
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    fn to_wire(message: &HubMessage) -> WireMessage {
        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => WireMessage {
                kind: message_type::INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..Default::default()
            },
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => WireMessage {
                kind: message_type::STREAM_ITEM,
                invocation_id: Some(invocation_id.clone()),
                item: Some(item.clone()),
                ..Default::default()
            },
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => WireMessage {
                kind: message_type::COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..Default::default()
            },
            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
            } => WireMessage {
                kind: message_type::STREAM_INVOCATION,
                invocation_id: Some(invocation_id.clone()),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..Default::default()
            },
            HubMessage::CancelInvocation { invocation_id } => WireMessage {
                kind: message_type::CANCEL_INVOCATION,
                invocation_id: Some(invocation_id.clone()),
                ..Default::default()
            },
            HubMessage::Ping => WireMessage {
                kind: message_type::PING,
                ..Default::default()
            },
            HubMessage::Close {
                error,
                allow_reconnect,
            } => WireMessage {
                kind: message_type::CLOSE,
                error: error.clone(),
                allow_reconnect: if *allow_reconnect { Some(true) } else { None },
                ..Default::default()
            },
        }
    }

    fn from_wire(wire: WireMessage) -> Result<HubMessage> {
        let message = match wire.kind {
            message_type::INVOCATION => HubMessage::Invocation {
                invocation_id: wire.invocation_id,
                target: wire
                    .target
                    .ok_or_else(|| HubError::protocol("invocation message is missing 'target'"))?,
                arguments: wire.arguments.unwrap_or_default(),
            },
            message_type::STREAM_ITEM => HubMessage::StreamItem {
                invocation_id: required_id(wire.invocation_id, "stream item")?,
                item: wire.item.unwrap_or(Value::Null),
            },
            message_type::COMPLETION => HubMessage::Completion {
                invocation_id: required_id(wire.invocation_id, "completion")?,
                result: wire.result,
                error: wire.error,
            },
            message_type::STREAM_INVOCATION => HubMessage::StreamInvocation {
                invocation_id: required_id(wire.invocation_id, "stream invocation")?,
                target: wire.target.ok_or_else(|| {
                    HubError::protocol("stream invocation message is missing 'target'")
                })?,
                arguments: wire.arguments.unwrap_or_default(),
            },
            message_type::CANCEL_INVOCATION => HubMessage::CancelInvocation {
                invocation_id: required_id(wire.invocation_id, "cancel invocation")?,
            },
            message_type::PING => HubMessage::Ping,
            message_type::CLOSE => HubMessage::Close {
                error: wire.error,
                allow_reconnect: wire.allow_reconnect.unwrap_or(false),
            },
            other => {
                return Err(HubError::protocol(format!(
                    "unsupported message type {other}"
                )));
            }
        };
        Ok(message)
    }
}

fn required_id(id: Option<String>, context: &str) -> Result<String> {
    match id {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(HubError::protocol(format!(
            "{context} message is missing 'invocationId'"
        ))),
    }
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn version(&self) -> i32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn parse_messages(&self, buf: &mut BytesMut) -> Result<Vec<HubMessage>> {
        let mut messages = Vec::new();
        while let Some(frame) = TextFraming::try_parse(buf) {
            let wire: WireMessage = serde_json::from_slice(&frame)
                .map_err(|e| HubError::protocol(format!("invalid JSON hub message: {e}")))?;
            messages.push(Self::from_wire(wire)?);
        }
        Ok(messages)
    }

    fn write_message(&self, message: &HubMessage, out: &mut BytesMut) -> Result<()> {
        let wire = Self::to_wire(message);
        let payload = serde_json::to_vec(&wire)
            .map_err(|e| HubError::protocol(format!("failed to encode hub message: {e}")))?;
        TextFraming::write(&payload, out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(message: HubMessage) {
        let protocol = JsonHubProtocol;
        let mut buf = BytesMut::new();
        protocol
            .write_message(&message, &mut buf)
            .expect("encode should succeed");
        let parsed = protocol.parse_messages(&mut buf).expect("parse should succeed");
        assert_eq!(parsed, vec![message]);
        assert!(buf.is_empty());
    }

    /// 测试：全部消息变体编码后可解析回等值消息
    #[test]
    fn test_round_trip_all_variants() {
        round_trip(HubMessage::Invocation {
            invocation_id: Some("1".to_string()),
            target: "Echo".to_string(),
            arguments: vec![json!("hello")],
        });
        round_trip(HubMessage::Invocation {
            invocation_id: None,
            target: "Notify".to_string(),
            arguments: vec![],
        });
        round_trip(HubMessage::StreamItem {
            invocation_id: "2".to_string(),
            item: json!({"seq": 1}),
        });
        round_trip(HubMessage::completion("1", Some(json!("hello"))));
        round_trip(HubMessage::completion_error("1", "boom"));
        round_trip(HubMessage::StreamInvocation {
            invocation_id: "3".to_string(),
            target: "Counter".to_string(),
            arguments: vec![json!(10)],
        });
        round_trip(HubMessage::CancelInvocation {
            invocation_id: "3".to_string(),
        });
        round_trip(HubMessage::Ping);
        round_trip(HubMessage::Close {
            error: Some("going away".to_string()),
            allow_reconnect: false,
        });
    }

    /// 测试：线上格式字段名与协议约定一致
    #[test]
    fn test_wire_shape() {
        let protocol = JsonHubProtocol;
        let encoded = protocol
            .encode(&HubMessage::Invocation {
                invocation_id: Some("1".to_string()),
                target: "Echo".to_string(),
                arguments: vec![json!("hello")],
            })
            .expect("encode should succeed");

        let text = std::str::from_utf8(&encoded[..encoded.len() - 1]).expect("utf8");
        let value: Value = serde_json::from_str(text).expect("json");
        assert_eq!(value["type"], json!(1));
        assert_eq!(value["invocationId"], json!("1"));
        assert_eq!(value["target"], json!("Echo"));
        assert_eq!(*encoded.last().expect("non-empty"), 0x1E);
    }

    /// 测试：未知类型标签是协议违例
    #[test]
    fn test_unknown_type_is_protocol_error() {
        let protocol = JsonHubProtocol;
        let mut buf = BytesMut::from(&b"{\"type\":9}\x1e"[..]);
        assert!(matches!(
            protocol.parse_messages(&mut buf),
            Err(HubError::Protocol(_))
        ));
    }

    /// 测试：一次网络读取中的多个帧全部取出
    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let protocol = JsonHubProtocol;
        let mut buf = BytesMut::from(&b"{\"type\":6}\x1e{\"type\":6}\x1e"[..]);
        let parsed = protocol.parse_messages(&mut buf).expect("parse");
        assert_eq!(parsed, vec![HubMessage::Ping, HubMessage::Ping]);
    }
}
