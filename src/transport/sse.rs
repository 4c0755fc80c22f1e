//! Server-Sent-Events 传输
//!
//! 接收方向是一条 `text/event-stream` HTTP 流式响应，发送方向退化为对同一
//! 连接 URL 的离散 POST 请求。只支持文本传输格式：二进制格式在发起任何
//! 请求之前就以能力错误快速失败

use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use async_trait::async_trait;

use crate::error::{HubError, Result};
use crate::transport::{
    ClientTransport, TransferFormat, TransportEvent, TransportEventSender, TransportKind, deliver,
};

/// SSE 事件流增量解析器
///
/// 跨网络读取保持行缓冲状态；`data:` 行累积到空行为止构成一个事件，
/// 多个 `data:` 行按 SSE 语法用换行拼接
#[derive(Default)]
struct SseParser {
    buf: BytesMut,
    data_lines: Vec<String>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(position) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line = self.buf.split_to(position);
            self.buf.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }

            let line = String::from_utf8_lossy(&line);
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // 其余字段（event / id / retry / 注释行）对 Hub 协议无意义，跳过
        }

        events
    }
}

/// SSE 客户端传输
pub struct ServerSentEventsTransport {
    http: reqwest::Client,
    events: TransportEventSender,
    token: CancellationToken,
    pump: Option<JoinHandle<()>>,
    send_url: Option<Url>,
    access_token: Option<String>,
}

impl ServerSentEventsTransport {
    /// 创建 SSE 传输，收到的事件载荷会推入 `events`
    pub fn new(
        http: reqwest::Client,
        events: TransportEventSender,
        access_token: Option<String>,
    ) -> Self {
        Self {
            http,
            events,
            token: CancellationToken::new(),
            pump: None,
            send_url: None,
            access_token,
        }
    }

    fn apply_bearer(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ClientTransport for ServerSentEventsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ServerSentEvents
    }

    async fn connect(&mut self, url: &Url, format: TransferFormat) -> Result<()> {
        if format == TransferFormat::Binary {
            return Err(HubError::transport(
                "The Server-Sent Events transport only supports the 'Text' transfer format.",
            ));
        }

        let response = self
            .apply_bearer(self.http.get(url.as_str()))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| HubError::transport(format!("SSE connect failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HubError::Http {
                status: response.status().as_u16(),
                message: "unexpected status opening event stream".to_string(),
            });
        }
        debug!(url = %url, "SSE transport connected");

        self.send_url = Some(url.clone());
        let events = self.events.clone();
        let token = self.token.clone();

        self.pump = Some(tokio::spawn(async move {
            let mut parser = SseParser::default();
            let mut stream = response.bytes_stream();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = events.try_send(TransportEvent::Closed(None));
                        break;
                    }

                    chunk = stream.next() => {
                        match chunk {
                            Some(Ok(chunk)) => {
                                for event in parser.push(&chunk) {
                                    let data =
                                        TransportEvent::Data(Bytes::from(event.into_bytes()));
                                    if !deliver(&events, &token, data).await {
                                        return;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                let closed = TransportEvent::Closed(Some(HubError::transport(
                                    format!("SSE stream failed: {e}"),
                                )));
                                deliver(&events, &token, closed).await;
                                break;
                            }
                            None => {
                                deliver(&events, &token, TransportEvent::Closed(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    async fn send(&mut self, data: Bytes) -> Result<()> {
        let url = self
            .send_url
            .as_ref()
            .ok_or_else(|| HubError::InvalidState("transport is not connected".to_string()))?;

        let response = self
            .apply_bearer(self.http.post(url.as_str()))
            .body(data)
            .send()
            .await
            .map_err(|e| HubError::transport(format!("SSE send failed: {e}")))?;

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
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试：SSE 事件按空行切分，载荷取自 data 字段
    #[test]
    fn test_parser_basic_event() {
        let mut parser = SseParser::default();
        let events = parser.push(b"data: {\"type\":6}\x1e\n\n");
        assert_eq!(events, vec!["{\"type\":6}\u{1e}".to_string()]);
    }

    /// 测试：跨读取拆分的事件能增量补齐，多个 data 行换行拼接
    #[test]
    fn test_parser_incremental_and_multiline() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"data: first").is_empty());
        assert!(parser.push(b"\ndata: second\n").is_empty());
        let events = parser.push(b"\n");
        assert_eq!(events, vec!["first\nsecond".to_string()]);
    }

    /// 测试：注释与未知字段被忽略，CRLF 行结束符可接受
    #[test]
    fn test_parser_ignores_noise() {
        let mut parser = SseParser::default();
        let events = parser.push(b": comment\r\nevent: message\r\ndata: payload\r\n\r\n");
        assert_eq!(events, vec!["payload".to_string()]);
    }

    /// 测试：二进制格式在连接前快速失败
    #[tokio::test]
    async fn test_binary_format_fails_fast() {
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let mut transport = ServerSentEventsTransport::new(reqwest::Client::new(), tx, None);
        let url = Url::parse("http://localhost:1/hub?id=x").expect("url");
        let result = transport.connect(&url, TransferFormat::Binary).await;
        assert!(matches!(result, Err(HubError::Transport(_))));
    }
}
