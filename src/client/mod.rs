//! Hub 客户端栈
//!
//! 协商、逻辑连接生命周期与 Hub 调用语义

pub mod connection;
pub mod hub;
pub mod negotiate;

pub use connection::{ConnectionState, HttpConnection};
pub use hub::HubClient;
pub use negotiate::NegotiateResponse;
