//! Hub 方法注册表
//!
//! 启动时通过显式注册构建方法名到类型化处理器的映射，不做运行时反射。
//! 描述符构建后不可变，只读共享给全部连接

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Future, FutureExt, Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::hub::clients::HubClients;
use crate::registry::ConnectionRegistry;

/// 传递给方法处理器的调用上下文
#[derive(Clone)]
pub struct HubContext {
    /// 发起调用的连接 ID
    pub connection_id: String,
    /// 取消信号：流式调用被取消或连接关闭时触发
    pub abort: CancellationToken,
    /// 广播代理入口
    pub clients: HubClients,
    registry: Arc<ConnectionRegistry>,
}

impl HubContext {
    pub fn new(
        connection_id: String,
        abort: CancellationToken,
        clients: HubClients,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            connection_id,
            abort,
            clients,
            registry,
        }
    }

    /// 把当前连接加入组
    pub fn join_group(&self, group: &str) {
        self.registry.add_to_group(group, &self.connection_id);
    }

    /// 把当前连接移出组
    pub fn leave_group(&self, group: &str) {
        self.registry.remove_from_group(group, &self.connection_id);
    }
}

type UnaryFn = Arc<dyn Fn(Vec<Value>, HubContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type StreamFn = Arc<dyn Fn(Vec<Value>, HubContext) -> BoxStream<'static, Result<Value>> + Send + Sync>;

/// 方法处理器
#[derive(Clone)]
pub enum MethodHandler {
    /// 一元调用：单个结果
    Unary(UnaryFn),
    /// 流式调用：结果序列增量送达
    Streaming(StreamFn),
}

/// Hub 方法描述符
///
/// 启动时构建一次，不可变，所有连接只读共享
pub struct HubMethodDescriptor {
    /// 注册时的方法名（保留原始大小写用于日志）
    pub name: String,
    /// 是否流式方法
    pub is_streaming: bool,
    /// 鉴权要求，交给鉴权评估器解释
    pub authorization: Vec<String>,
    /// 处理器本体
    pub handler: MethodHandler,
}

/// 方法注册表，方法名大小写不敏感
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<HubMethodDescriptor>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一元方法
    pub fn unary<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>, HubContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.unary_with_auth(name, Vec::new(), handler)
    }

    /// 注册带鉴权要求的一元方法
    pub fn unary_with_auth<F, Fut>(
        mut self,
        name: &str,
        authorization: Vec<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(Vec<Value>, HubContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: UnaryFn = Arc::new(move |args, ctx| handler(args, ctx).boxed());
        self.insert(name, false, authorization, MethodHandler::Unary(handler));
        self
    }

    /// 注册流式方法
    pub fn streaming<F, St>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>, HubContext) -> St + Send + Sync + 'static,
        St: Stream<Item = Result<Value>> + Send + 'static,
    {
        self.streaming_with_auth(name, Vec::new(), handler)
    }

    /// 注册带鉴权要求的流式方法
    pub fn streaming_with_auth<F, St>(
        mut self,
        name: &str,
        authorization: Vec<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(Vec<Value>, HubContext) -> St + Send + Sync + 'static,
        St: Stream<Item = Result<Value>> + Send + 'static,
    {
        let handler: StreamFn = Arc::new(move |args, ctx| handler(args, ctx).boxed());
        self.insert(name, true, authorization, MethodHandler::Streaming(handler));
        self
    }

    fn insert(
        &mut self,
        name: &str,
        is_streaming: bool,
        authorization: Vec<String>,
        handler: MethodHandler,
    ) {
        let descriptor = Arc::new(HubMethodDescriptor {
            name: name.to_string(),
            is_streaming,
            authorization,
            handler,
        });
        self.methods.insert(name.to_lowercase(), descriptor);
    }

    /// 按方法名查找（大小写不敏感）
    pub fn get(&self, target: &str) -> Option<Arc<HubMethodDescriptor>> {
        self.methods.get(&target.to_lowercase()).cloned()
    }

    /// 已注册方法数
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Hub 实例激活器
///
/// 外部协作者接口：连接建立时 `create`，连接拆除时 `release`。
/// 处理器闭包自行持有状态时用默认实现即可
#[async_trait]
pub trait HubActivator: Send + Sync {
    async fn create(&self, connection_id: &str) -> Result<()>;
    async fn release(&self, connection_id: &str);
}

/// 无状态默认激活器
pub struct DefaultActivator;

#[async_trait]
impl HubActivator for DefaultActivator {
    async fn create(&self, _connection_id: &str) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _connection_id: &str) {}
}

/// 调用方身份
#[derive(Debug, Clone, Default)]
pub struct Principal {
    /// 传输层携带的身份标识（如 Bearer 令牌解析结果），未鉴权时为 None
    pub identity: Option<String>,
}

/// 鉴权评估器
///
/// 外部协作者接口：策略解释不在本库范围内
pub trait AuthorizationEvaluator: Send + Sync {
    fn is_authorized(&self, principal: &Principal, requirements: &[String]) -> bool;
}

/// 放行一切的默认评估器
pub struct AllowAllAuthorizer;

impl AuthorizationEvaluator for AllowAllAuthorizer {
    fn is_authorized(&self, _principal: &Principal, _requirements: &[String]) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// 测试：方法名查找大小写不敏感
    #[test]
    fn test_case_insensitive_lookup() {
        let registry = MethodRegistry::new().unary("Echo", |args, _ctx| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        });

        assert!(registry.get("echo").is_some());
        assert!(registry.get("ECHO").is_some());
        assert!(registry.get("missing").is_none());

        let descriptor = registry.get("echo").expect("descriptor");
        assert_eq!(descriptor.name, "Echo");
        assert!(!descriptor.is_streaming);
    }

    /// 测试：一元处理器执行
    #[tokio::test]
    async fn test_unary_handler_runs() {
        let registry = MethodRegistry::new().unary("Add", |args, _ctx| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        });

        let descriptor = registry.get("add").expect("descriptor");
        let MethodHandler::Unary(handler) = &descriptor.handler else {
            panic!("expected unary handler");
        };

        let clients = HubClients::new(Arc::new(crate::hub::clients::LocalBackplane::new(
            Arc::new(ConnectionRegistry::new()),
        )));
        let ctx = HubContext::new(
            "c1".to_string(),
            CancellationToken::new(),
            clients,
            Arc::new(ConnectionRegistry::new()),
        );
        let result = handler(vec![json!(2), json!(3)], ctx).await.expect("sum");
        assert_eq!(result, json!(5));
    }
}
