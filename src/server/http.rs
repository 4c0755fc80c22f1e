//! HTTP 传输端点
//!
//! 对外暴露协议约定的四个端点：
//! - `POST <base>/negotiate`：分配连接 ID，通告可用传输
//! - `GET <base>?id=`：按请求特征升级 WebSocket、打开 SSE 流或执行一次长轮询
//! - `POST <base>?id=`：SSE / 长轮询连接的客户端上行通道
//! - `DELETE <base>?id=`：终止长轮询连接（下一次轮询收到 204）

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::Json;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::client::negotiate::NegotiateResponse;
use crate::hub::methods::Principal;
use crate::server::connection::ServerConnection;
use crate::server::HubServer;
use crate::transport::{TransferFormat, TransportKind};

/// 构造协议栈的 axum 路由，宿主可以嵌套挂载到任意基础路径
pub(crate) fn router(server: HubServer) -> Router {
    Router::new()
        .route("/negotiate", post(negotiate))
        .route(
            "/",
            get(transport_get).post(transport_post).delete(transport_delete),
        )
        .with_state(server)
}

fn principal_from(headers: &HeaderMap, params: &HashMap<String, String>) -> Principal {
    let identity = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| params.get("access_token").cloned());
    Principal { identity }
}

async fn negotiate(
    State(server): State<HubServer>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let principal = principal_from(&headers, &params);
    let connection = server.create_connection(principal);
    debug!(connection_id = %connection.id, "negotiate allocated connection");

    Json(NegotiateResponse {
        connection_id: connection.id.clone(),
        available_transports: vec![
            TransportKind::WebSockets.wire_name().to_string(),
            TransportKind::ServerSentEvents.wire_name().to_string(),
            TransportKind::LongPolling.wire_name().to_string(),
        ],
    })
    .into_response()
}

async fn transport_get(
    State(server): State<HubServer>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    // WebSocket 升级：显式指定 WebSockets 的客户端会跳过协商直接连上来，
    // 此时没有 id，现场分配连接
    if let Some(ws) = ws {
        let connection = match params.get("id") {
            Some(id) => match server.endpoint(id) {
                Some(connection) => connection,
                None => return StatusCode::NOT_FOUND.into_response(),
            },
            None => {
                let principal = principal_from(&headers, &params);
                server.create_connection(principal)
            }
        };
        if connection.attach_transport(TransportKind::WebSockets).is_err() {
            return StatusCode::CONFLICT.into_response();
        }
        return ws.on_upgrade(move |socket| websocket_pump(socket, connection));
    }

    let Some(id) = params.get("id") else {
        return (StatusCode::BAD_REQUEST, "connection id is required").into_response();
    };
    let Some(connection) = server.endpoint(id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let wants_sse = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));

    if wants_sse {
        if connection
            .attach_transport(TransportKind::ServerSentEvents)
            .is_err()
        {
            return StatusCode::CONFLICT.into_response();
        }
        return sse_stream(connection).into_response();
    }

    if connection.attach_transport(TransportKind::LongPolling).is_err() {
        return StatusCode::CONFLICT.into_response();
    }
    long_poll(server, connection).await
}

/// WebSocket 收发泵
///
/// 读写两个方向各自独立运行：读方向阻塞在入站队列时写方向仍在排空
/// 出站队列，两个方向的队列不会互相抵住
async fn websocket_pump(socket: WebSocket, connection: Arc<ServerConnection>) {
    let (sender, receiver) = socket.split();

    let write_connection = connection.clone();
    let write_task = tokio::spawn(websocket_write_pump(sender, write_connection));
    websocket_read_pump(receiver, connection.clone()).await;

    connection.token.cancel();
    let _ = write_task.await;
}

async fn websocket_write_pump(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    connection: Arc<ServerConnection>,
) {
    let mut wire = connection.wire_rx.lock().await;
    loop {
        tokio::select! {
            biased;

            _ = connection.token.cancelled() => {
                // 先把已排队的帧（典型的是携带错误的 Close 帧）刷出去
                while let Ok(frame) = wire.try_recv() {
                    let message = match connection.transfer_format() {
                        TransferFormat::Binary => Message::Binary(frame.to_vec()),
                        TransferFormat::Text => match String::from_utf8(frame.to_vec()) {
                            Ok(text) => Message::Text(text),
                            Err(_) => continue,
                        },
                    };
                    if sender.send(message).await.is_err() {
                        break;
                    }
                }
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            frame = wire.recv() => {
                let Some(frame) = frame else { break };
                let message = match connection.transfer_format() {
                    TransferFormat::Binary => Message::Binary(frame.to_vec()),
                    TransferFormat::Text => match String::from_utf8(frame.to_vec()) {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            warn!(error = %e, "dropping non-UTF-8 frame on text connection");
                            continue;
                        }
                    },
                };
                if sender.send(message).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn websocket_read_pump(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    connection: Arc<ServerConnection>,
) {
    loop {
        tokio::select! {
            _ = connection.token.cancelled() => break,

            incoming = receiver.next() => {
                let payload = match incoming {
                    Some(Ok(Message::Text(text))) => Bytes::from(text.into_bytes()),
                    Some(Ok(Message::Binary(data))) => Bytes::from(data),
                    // Ping/Pong 由底层协议栈自动应答
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection_id = %connection.id, error = %e, "websocket receive error");
                        break;
                    }
                };

                tokio::select! {
                    _ = connection.token.cancelled() => break,
                    sent = connection.inbound_tx.send(payload) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// SSE 下行流：出站队列的每一帧作为一个 `data:` 事件送出
fn sse_stream(
    connection: Arc<ServerConnection>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold(connection, |connection| async move {
        let frame = {
            let mut wire = connection.wire_rx.lock().await;
            tokio::select! {
                // 连接拆除后先排空已排队的帧（典型的是 Close 帧）再结束流
                _ = connection.token.cancelled() => wire.try_recv().ok(),
                frame = wire.recv() => frame,
            }
        };
        frame.map(|frame| {
            let data = String::from_utf8_lossy(&frame).into_owned();
            (Ok(Event::default().data(data)), connection)
        })
    });
    Sse::new(stream)
}

/// 单次长轮询：等到数据返回 200，服务端等待窗口耗尽返回 200 空体，
/// 连接终结返回 204
async fn long_poll(server: HubServer, connection: Arc<ServerConnection>) -> Response {
    let wait = server.inner.config.poll_wait();
    // 空轮询本身就是对端活跃的信号
    connection.touch_activity();
    let mut wire = connection.wire_rx.lock().await;

    let first = tokio::select! {
        _ = connection.token.cancelled() => return StatusCode::NO_CONTENT.into_response(),
        result = tokio::time::timeout(wait, wire.recv()) => match result {
            Ok(Some(frame)) => frame,
            Ok(None) => return StatusCode::NO_CONTENT.into_response(),
            // 等待窗口耗尽：空轮询，客户端立即重新轮询
            Err(_) => return StatusCode::OK.into_response(),
        },
    };

    // 把已经排队的帧一并带回，帧自带边界，拼接是安全的
    let mut body = first.to_vec();
    while let Ok(frame) = wire.try_recv() {
        body.extend_from_slice(&frame);
    }
    (StatusCode::OK, body).into_response()
}

async fn transport_post(
    State(server): State<HubServer>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let Some(id) = params.get("id") else {
        return (StatusCode::BAD_REQUEST, "connection id is required").into_response();
    };
    let Some(connection) = server.endpoint(id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if connection.inbound_tx.send(body).await.is_err() {
        // 分发器已经退出，连接等同不存在
        return StatusCode::NOT_FOUND.into_response();
    }
    StatusCode::OK.into_response()
}

async fn transport_delete(
    State(server): State<HubServer>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = params.get("id") else {
        return (StatusCode::BAD_REQUEST, "connection id is required").into_response();
    };
    let Some(connection) = server.endpoint(id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    debug!(connection_id = %connection.id, "client requested connection termination");
    connection.token.cancel();
    StatusCode::ACCEPTED.into_response()
}
