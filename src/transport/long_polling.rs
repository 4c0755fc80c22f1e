//! 长轮询传输
//!
//! 接收方向是一个 GET 请求循环：每次请求要么带回载荷（投递后立即重新轮询），
//! 要么空轮询超时（直接重新轮询），要么收到终止状态
//! （204 为服务端主动关闭，其余非 2xx 为传输错误）。
//! 发送方向与 SSE 相同，是对连接 URL 的离散 POST。
//! 空轮询循环本身就是活跃信号，所以该传输天然具备保活能力

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{HubError, Result};
use crate::transport::{
    ClientTransport, TransferFormat, TransportEvent, TransportEventSender, TransportKind, deliver,
};

/// 长轮询客户端传输
pub struct LongPollingTransport {
    http: reqwest::Client,
    events: TransportEventSender,
    token: CancellationToken,
    pump: Option<JoinHandle<()>>,
    url: Option<Url>,
    access_token: Option<String>,
    /// 单次轮询请求的客户端超时，区别于 Hub 层静默超时；
    /// 单次超时不是错误，只触发立即重新轮询
    request_timeout: Duration,
}

impl LongPollingTransport {
    /// 创建长轮询传输，收到的载荷会推入 `events`
    pub fn new(
        http: reqwest::Client,
        events: TransportEventSender,
        access_token: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http,
            events,
            token: CancellationToken::new(),
            pump: None,
            url: None,
            access_token,
            request_timeout,
        }
    }

    fn apply_bearer(
        request: reqwest::RequestBuilder,
        access_token: &Option<String>,
    ) -> reqwest::RequestBuilder {
        match access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ClientTransport for LongPollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPolling
    }

    fn inherent_keep_alive(&self) -> bool {
        true
    }

    async fn connect(&mut self, url: &Url, _format: TransferFormat) -> Result<()> {
        self.url = Some(url.clone());

        let http = self.http.clone();
        let events = self.events.clone();
        let token = self.token.clone();
        let poll_url = url.clone();
        let access_token = self.access_token.clone();
        let request_timeout = self.request_timeout;
        debug!(url = %url, "long polling transport started");

        self.pump = Some(tokio::spawn(async move {
            loop {
                let request = Self::apply_bearer(http.get(poll_url.as_str()), &access_token)
                    .timeout(request_timeout)
                    .send();

                let response = tokio::select! {
                    _ = token.cancelled() => {
                        let _ = events.try_send(TransportEvent::Closed(None));
                        return;
                    }
                    response = request => response,
                };

                match response {
                    Ok(response) if response.status() == StatusCode::NO_CONTENT => {
                        // 服务端主动关闭
                        deliver(&events, &token, TransportEvent::Closed(None)).await;
                        return;
                    }
                    Ok(response) if response.status().is_success() => {
                        match response.bytes().await {
                            Ok(body) if body.is_empty() => {
                                // 空轮询，立即重新轮询
                            }
                            Ok(body) => {
                                if !deliver(&events, &token, TransportEvent::Data(body)).await {
                                    return;
                                }
                            }
                            Err(e) => {
                                let closed = TransportEvent::Closed(Some(HubError::transport(
                                    format!("long polling body read failed: {e}"),
                                )));
                                deliver(&events, &token, closed).await;
                                return;
                            }
                        }
                    }
                    Ok(response) => {
                        let closed = TransportEvent::Closed(Some(HubError::Http {
                            status: response.status().as_u16(),
                            message: "unexpected status from poll request".to_string(),
                        }));
                        deliver(&events, &token, closed).await;
                        return;
                    }
                    Err(e) if e.is_timeout() => {
                        // 单次轮询超时，立即重新轮询
                    }
                    Err(e) => {
                        let closed = TransportEvent::Closed(Some(HubError::transport(format!(
                            "poll request failed: {e}"
                        ))));
                        deliver(&events, &token, closed).await;
                        return;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn send(&mut self, data: Bytes) -> Result<()> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| HubError::InvalidState("transport is not connected".to_string()))?;

        let response = Self::apply_bearer(self.http.post(url.as_str()), &self.access_token)
            .body(data)
            .send()
            .await
            .map_err(|e| HubError::transport(format!("long polling send failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HubError::Http {
                status: response.status().as_u16(),
                message: "unexpected status posting to connection".to_string(),
            });
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.token.cancel();

        // 通知服务端终止连接，失败只记录不阻塞停止流程
        if let Some(url) = self.url.take() {
            let request = Self::apply_bearer(self.http.delete(url.as_str()), &self.access_token);
            if let Err(e) = request.send().await {
                warn!(error = %e, "failed to send DELETE for long polling connection");
            }
        }

        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        Ok(())
    }
}
