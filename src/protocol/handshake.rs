//! 连接握手帧
//!
//! 传输层物理连通之后、Hub 消息流开始之前，双方交换一次握手：
//! 客户端声明协议名称和版本，服务端回复空对象（成功）或携带 error 字段（失败）。
//! 无论协商出哪种 Hub 协议，握手帧始终是记录分隔符结尾的 JSON 文本帧

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{HubError, Result};
use crate::protocol::framing::TextFraming;

/// 握手请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// 协议名称，如 `json`
    pub protocol: String,
    /// 协议版本
    pub version: i32,
}

/// 握手响应；`error` 为 `None` 即成功
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// 成功响应
    pub fn ok() -> Self {
        Self { error: None }
    }

    /// 失败响应
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }
}

/// 编码握手请求帧
pub fn write_request(request: &HandshakeRequest) -> Result<Bytes> {
    write_framed(request)
}

/// 编码握手响应帧
pub fn write_response(response: &HandshakeResponse) -> Result<Bytes> {
    write_framed(response)
}

fn write_framed<T: Serialize>(value: &T) -> Result<Bytes> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| HubError::protocol(format!("failed to encode handshake frame: {e}")))?;
    let mut out = BytesMut::new();
    TextFraming::write(&payload, &mut out);
    Ok(out.freeze())
}

/// 从缓冲区解析握手请求；输入不完整时返回 `Ok(None)`
pub fn try_parse_request(buf: &mut BytesMut) -> Result<Option<HandshakeRequest>> {
    try_parse_framed(buf)
}

/// 从缓冲区解析握手响应；输入不完整时返回 `Ok(None)`
pub fn try_parse_response(buf: &mut BytesMut) -> Result<Option<HandshakeResponse>> {
    try_parse_framed(buf)
}

fn try_parse_framed<T: serde::de::DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>> {
    let Some(frame) = TextFraming::try_parse(buf) else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&frame)
        .map_err(|e| HubError::protocol(format!("invalid handshake frame: {e}")))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试：握手请求往返
    #[test]
    fn test_request_round_trip() {
        let request = HandshakeRequest {
            protocol: "json".to_string(),
            version: 1,
        };
        let encoded = write_request(&request).expect("encode");
        let mut buf = BytesMut::from(&encoded[..]);
        let parsed = try_parse_request(&mut buf).expect("parse").expect("complete");
        assert_eq!(parsed, request);
    }

    /// 测试：成功响应编码为空 JSON 对象
    #[test]
    fn test_success_response_is_empty_object() {
        let encoded = write_response(&HandshakeResponse::ok()).expect("encode");
        assert_eq!(&encoded[..], b"{}\x1e");
    }

    /// 测试：不完整的握手帧等待更多输入
    #[test]
    fn test_incomplete_request() {
        let mut buf = BytesMut::from(&b"{\"protocol\":\"js"[..]);
        assert!(try_parse_request(&mut buf).expect("no error").is_none());
    }
}
