//! 连接协商
//!
//! 向 `<base>/negotiate` 发起 POST 获取连接 ID 和服务端可用传输列表，
//! 然后按选择规则确定实际使用的传输。显式指定 WebSockets 的调用方
//! 会完全跳过协商往返（由上层连接逻辑处理）。
//! 协商请求失败直接作为 start() 的失败向上传播，这一层不做重试

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ERR_NO_TRANSPORT, HubError, Result};
use crate::transport::{TransferFormat, TransportKind};

/// 协商响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateResponse {
    /// 本次逻辑连接的多路复用键
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    /// 服务端可用传输名称，按服务端优先级排序
    #[serde(rename = "availableTransports")]
    pub available_transports: Vec<String>,
}

/// 发起协商请求
pub async fn negotiate(
    http: &reqwest::Client,
    base: &Url,
    access_token: Option<&str>,
) -> Result<NegotiateResponse> {
    let url = negotiate_url(base);
    let mut request = http.post(url.as_str());
    if let Some(token) = access_token {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| HubError::Negotiation(format!("negotiate request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(HubError::Negotiation(format!(
            "negotiate request returned status {}",
            response.status().as_u16()
        )));
    }

    response
        .json::<NegotiateResponse>()
        .await
        .map_err(|e| HubError::Negotiation(format!("invalid negotiate response: {e}")))
}

/// 由基础 URL 构造协商 URL，保留原有查询串
pub fn negotiate_url(base: &Url) -> Url {
    let mut url = base.clone();
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url
}

/// 协商完成后的连接 URL：`<base>?id=<connectionId>`，保留原有查询串
pub fn connection_url(base: &Url, connection_id: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("id", connection_id);
    url
}

/// 按选择规则确定传输
///
/// - 调用方显式指定的传输：在列表中则使用，否则失败
/// - 未指定：按服务端给出的顺序选第一个本端可构造且支持目标格式的传输
/// - 一个都没有：以协商错误失败
pub fn select_transport(
    requested: Option<TransportKind>,
    available: &[String],
    format: TransferFormat,
) -> Result<TransportKind> {
    if let Some(requested) = requested {
        if !available.iter().any(|name| name == requested.wire_name()) {
            return Err(HubError::Negotiation(format!(
                "The requested transport '{requested}' is not available on the server."
            )));
        }
        if !requested.supports(format) {
            return Err(HubError::Negotiation(ERR_NO_TRANSPORT.to_string()));
        }
        return Ok(requested);
    }

    available
        .iter()
        .filter_map(|name| TransportKind::from_wire_name(name))
        .find(|kind| kind.supports(format))
        .ok_or_else(|| HubError::Negotiation(ERR_NO_TRANSPORT.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试：空传输列表以约定文案失败
    #[test]
    fn test_empty_transport_list_fails() {
        let err = select_transport(None, &[], TransferFormat::Text).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to initialize any of the available transports."
        );
    }

    /// 测试：显式指定但不在列表中的传输失败
    #[test]
    fn test_requested_transport_missing_fails() {
        let available = vec!["ServerSentEvents".to_string()];
        let err = select_transport(
            Some(TransportKind::WebSockets),
            &available,
            TransferFormat::Text,
        )
        .unwrap_err();
        assert!(err.to_string().contains("WebSockets"));
    }

    /// 测试：未指定时按服务端顺序选择第一个可用传输
    #[test]
    fn test_server_order_wins() {
        let available = vec![
            "Carrier Pigeon".to_string(),
            "ServerSentEvents".to_string(),
            "WebSockets".to_string(),
        ];
        let kind = select_transport(None, &available, TransferFormat::Text).expect("selected");
        assert_eq!(kind, TransportKind::ServerSentEvents);
    }

    /// 测试：二进制格式下跳过 SSE
    #[test]
    fn test_binary_skips_sse() {
        let available = vec![
            "ServerSentEvents".to_string(),
            "LongPolling".to_string(),
        ];
        let kind = select_transport(None, &available, TransferFormat::Binary).expect("selected");
        assert_eq!(kind, TransportKind::LongPolling);
    }

    /// 测试：连接 URL 保留已有查询串
    #[test]
    fn test_connection_url_preserves_query() {
        let base = Url::parse("http://localhost:8080/hub?tenant=acme").expect("url");
        let url = connection_url(&base, "abc123");
        assert_eq!(url.as_str(), "http://localhost:8080/hub?tenant=acme&id=abc123");
    }

    /// 测试：协商 URL 追加在路径末尾且保留查询串
    #[test]
    fn test_negotiate_url() {
        let base = Url::parse("http://localhost:8080/hub?tenant=acme").expect("url");
        assert_eq!(
            negotiate_url(&base).as_str(),
            "http://localhost:8080/hub/negotiate?tenant=acme"
        );
    }
}
