//! Flare Hub 配置模块
//!
//! 提供客户端与服务端的可调参数定义和 TOML 配置文件加载，
//! 所有字段都有默认值，配置文件中可以只覆盖需要的部分

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

/// Hub 协议层公共配置（客户端 / 服务端共用）
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// 保活 Ping 注入间隔（秒）
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,
    /// 对端静默超时（秒），超过后强制关闭连接
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,
    /// 握手超时（秒）
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// 单帧最大长度（字节），二进制帧长度前缀超过该值视为帧格式错误
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// 是否在 Completion.error 中携带详细错误信息
    ///
    /// 关闭时调用方只能看到通用错误文案，避免泄漏服务端内部细节
    #[serde(default)]
    pub detailed_errors: bool,
    /// 每个连接出站队列容量
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

fn default_keep_alive_interval_secs() -> u64 {
    15
}

fn default_client_timeout_secs() -> u64 {
    30
}

fn default_handshake_timeout_secs() -> u64 {
    15
}

fn default_max_frame_size() -> usize {
    1024 * 1024
}

fn default_outbound_capacity() -> usize {
    64
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            client_timeout_secs: default_client_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_frame_size: default_max_frame_size(),
            detailed_errors: false,
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

impl HubConfig {
    /// 保活间隔
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    /// 对端静默超时
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    /// 握手超时
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// 校验配置的软约束
    ///
    /// 约定 client_timeout 至少是 keep_alive_interval 的两倍，
    /// 不满足时只告警不拒绝
    pub fn validate(&self) {
        if self.client_timeout_secs < self.keep_alive_interval_secs * 2 {
            warn!(
                keep_alive_interval_secs = self.keep_alive_interval_secs,
                client_timeout_secs = self.client_timeout_secs,
                "client timeout is less than twice the keep-alive interval"
            );
        }
    }
}

/// 服务端配置
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Hub 协议层配置
    #[serde(default)]
    pub hub: HubConfig,
    /// 长轮询单次请求的服务端等待时长（秒）
    #[serde(default = "default_poll_wait_secs")]
    pub poll_wait_secs: u64,
}

fn default_poll_wait_secs() -> u64 {
    90
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            poll_wait_secs: default_poll_wait_secs(),
        }
    }
}

impl ServerConfig {
    /// 长轮询服务端等待时长
    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs)
    }
}

/// 客户端配置
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Hub 协议层配置
    #[serde(default)]
    pub hub: HubConfig,
    /// 长轮询单次 GET 请求的客户端超时（秒），区别于 hub 层静默超时；
    /// 单次轮询超时不是错误，只触发立即重新轮询
    #[serde(default = "default_poll_request_timeout_secs")]
    pub poll_request_timeout_secs: u64,
    /// Bearer 令牌，协商请求与后续传输请求都会携带
    #[serde(default)]
    pub access_token: Option<String>,
}

fn default_poll_request_timeout_secs() -> u64 {
    100
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            poll_request_timeout_secs: default_poll_request_timeout_secs(),
            access_token: None,
        }
    }
}

impl ClientConfig {
    /// 长轮询单次请求超时
    pub fn poll_request_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_request_timeout_secs)
    }
}

/// 从 TOML 文件加载配置
///
/// 文件不存在或解析失败都会返回错误，调用方决定是否回退到默认配置
pub fn load_config<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}
