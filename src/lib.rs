//! Flare Hub 实时双向通信协议栈
//!
//! 在一条逻辑双工连接（WebSocket / Server-Sent-Events / 长轮询三选一）之上
//! 多路复用方法调用、流式结果与服务端主动调用：
//! - 客户端栈：HTTP 协商、传输选择、连接生命周期、Hub 调用语义
//! - 服务端栈：传输端点、连接注册表、调用分发器、保活监控与广播代理

pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
pub mod utils;

pub use client::{HubClient, HttpConnection, NegotiateResponse};
pub use config::{ClientConfig, HubConfig, ServerConfig, load_config};
pub use error::{HubError, Result};
pub use hub::{HubClients, HubContext, MethodRegistry};
pub use protocol::{HubMessage, HubProtocol, JsonHubProtocol};
pub use registry::ConnectionRegistry;
pub use server::HubServer;
pub use transport::{TransferFormat, TransportKind};
