//! 线上协议层
//!
//! 帧编解码、Hub 消息模型、握手帧与具体协议编解码器

pub mod framing;
pub mod handshake;
pub mod json;
pub mod message;

pub use framing::{BinaryFraming, RECORD_SEPARATOR, TextFraming};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use json::{HubProtocol, JsonHubProtocol};
pub use message::{HubMessage, SerializedMessage};
