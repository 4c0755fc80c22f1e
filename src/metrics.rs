//! # Prometheus 指标收集模块
//!
//! 为 Hub 服务端提供统一的 Prometheus 指标收集能力。

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Hub 服务端指标
pub struct HubMetrics {
    /// 当前活跃连接数
    pub connections_active: IntGauge,
    /// 累计建立连接数
    pub connections_total: IntCounter,
    /// 收到的 Hub 消息总数
    pub messages_received_total: IntCounter,
    /// 发出的 Hub 消息总数
    pub messages_sent_total: IntCounter,
    /// 方法调用总数（按调用结果分类）
    pub invocations_total: IntCounterVec,
    /// 注入的保活 Ping 总数
    pub pings_sent_total: IntCounter,
}

impl HubMetrics {
    pub fn new(registry: &Registry) -> Self {
        let connections_active = IntGauge::new(
            "hub_connections_active",
            "Number of currently active hub connections",
        )
        .expect("Failed to create hub_connections_active metric");

        let connections_total = IntCounter::new(
            "hub_connections_total",
            "Total number of hub connections established",
        )
        .expect("Failed to create hub_connections_total metric");

        let messages_received_total = IntCounter::new(
            "hub_messages_received_total",
            "Total number of hub messages received from clients",
        )
        .expect("Failed to create hub_messages_received_total metric");

        let messages_sent_total = IntCounter::new(
            "hub_messages_sent_total",
            "Total number of hub messages written to clients",
        )
        .expect("Failed to create hub_messages_sent_total metric");

        let invocations_total = IntCounterVec::new(
            Opts::new(
                "hub_invocations_total",
                "Total number of hub method invocations",
            ),
            &["outcome"],
        )
        .expect("Failed to create hub_invocations_total metric");

        let pings_sent_total = IntCounter::new(
            "hub_pings_sent_total",
            "Total number of keep-alive pings injected",
        )
        .expect("Failed to create hub_pings_sent_total metric");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(connections_active.clone()),
            Box::new(connections_total.clone()),
            Box::new(messages_received_total.clone()),
            Box::new(messages_sent_total.clone()),
            Box::new(invocations_total.clone()),
            Box::new(pings_sent_total.clone()),
        ];
        for collector in collectors {
            // 重复注册（例如测试中多次构建服务端）不视为致命问题
            let _ = registry.register(collector);
        }

        Self {
            connections_active,
            connections_total,
            messages_received_total,
            messages_sent_total,
            invocations_total,
            pings_sent_total,
        }
    }

    /// 记录一次调用结果
    pub fn observe_invocation(&self, outcome: &str) {
        self.invocations_total.with_label_values(&[outcome]).inc();
    }
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new(&REGISTRY)
    }
}
