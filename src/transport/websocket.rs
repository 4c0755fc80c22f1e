//! WebSocket 传输
//!
//! 单条物理双工 socket。连接建立后拆分读写两端，由一个后台任务驱动：
//! 读方向把帧载荷转发给上层 channel，写方向排空出站队列。
//! 非 1000 关闭码的异常关闭作为传输错误向上层暴露

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{HubError, Result};
use crate::transport::{
    ClientTransport, TransferFormat, TransportEvent, TransportEventSender, TransportKind, deliver,
};

/// WebSocket 客户端传输
pub struct WebSocketTransport {
    events: TransportEventSender,
    outbound: Option<mpsc::Sender<Bytes>>,
    token: CancellationToken,
    pump: Option<JoinHandle<()>>,
    format: TransferFormat,
    outbound_capacity: usize,
}

impl WebSocketTransport {
    /// 创建 WebSocket 传输，收到的数据会推入 `events`
    pub fn new(events: TransportEventSender, outbound_capacity: usize) -> Self {
        Self {
            events,
            outbound: None,
            token: CancellationToken::new(),
            pump: None,
            format: TransferFormat::Text,
            outbound_capacity,
        }
    }

    /// 把 HTTP URL 转换为对应的 WebSocket URL
    fn websocket_url(url: &Url) -> Result<Url> {
        let mut url = url.clone();
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => return Ok(url),
            other => {
                return Err(HubError::transport(format!(
                    "unsupported URL scheme for WebSocket transport: {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| HubError::transport("failed to rewrite URL scheme"))?;
        Ok(url)
    }
}

#[async_trait]
impl ClientTransport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSockets
    }

    async fn connect(&mut self, url: &Url, format: TransferFormat) -> Result<()> {
        let ws_url = Self::websocket_url(url)?;
        self.format = format;

        let (stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| HubError::transport(format!("WebSocket connect failed: {e}")))?;
        debug!(url = %ws_url, "WebSocket transport connected");

        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(self.outbound_capacity);
        let events = self.events.clone();
        let token = self.token.clone();

        self.pump = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        // 拆除发起方已经不再消费事件队列，尽力投递即可
                        let _ = events.try_send(TransportEvent::Closed(None));
                        break;
                    }

                    outgoing = outbound_rx.recv() => {
                        let Some(data) = outgoing else { break };
                        let message = match format {
                            TransferFormat::Text => match String::from_utf8(data.to_vec()) {
                                Ok(text) => Message::Text(text),
                                Err(e) => {
                                    warn!(error = %e, "dropping non-UTF-8 payload on text transport");
                                    continue;
                                }
                            },
                            TransferFormat::Binary => Message::Binary(data.to_vec()),
                        };
                        if let Err(e) = write.send(message).await {
                            let closed = TransportEvent::Closed(Some(HubError::transport(
                                format!("WebSocket send failed: {e}"),
                            )));
                            deliver(&events, &token, closed).await;
                            break;
                        }
                    }

                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                let data = TransportEvent::Data(Bytes::from(text.into_bytes()));
                                if !deliver(&events, &token, data).await {
                                    break;
                                }
                            }
                            Some(Ok(Message::Binary(data))) => {
                                let data = TransportEvent::Data(Bytes::from(data));
                                if !deliver(&events, &token, data).await {
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let error = match &frame {
                                    Some(f) if f.code != CloseCode::Normal => {
                                        Some(HubError::transport(format!(
                                            "WebSocket closed with status code '{}'",
                                            u16::from(f.code)
                                        )))
                                    }
                                    _ => None,
                                };
                                deliver(&events, &token, TransportEvent::Closed(error)).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let closed = TransportEvent::Closed(Some(HubError::transport(
                                    format!("WebSocket receive failed: {e}"),
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

        self.outbound = Some(outbound_tx);
        Ok(())
    }

    async fn send(&mut self, data: Bytes) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| HubError::InvalidState("transport is not connected".to_string()))?;
        outbound
            .send(data)
            .await
            .map_err(|_| HubError::transport("WebSocket transport is closed"))
    }

    async fn stop(&mut self) -> Result<()> {
        self.token.cancel();
        self.outbound = None;
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        Ok(())
    }
}
