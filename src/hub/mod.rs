//! Hub 层
//!
//! 调用分发、方法注册、广播代理与保活监控

pub mod clients;
pub mod dispatcher;
pub mod keepalive;
pub mod methods;

pub use clients::{Backplane, BroadcastScope, CachedMessage, ClientProxy, HubClients, LocalBackplane};
pub use dispatcher::{HubDispatcher, HubState};
pub use keepalive::{KeepAliveMonitor, ReceiveClock};
pub use methods::{
    AllowAllAuthorizer, AuthorizationEvaluator, DefaultActivator, HubActivator, HubContext,
    HubMethodDescriptor, MethodHandler, MethodRegistry, Principal,
};
