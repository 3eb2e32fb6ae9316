//! WebSocket endpoint glue.
//!
//! The upgrade handler always accepts the socket, then validates inside it:
//! protocol errors are reported to the peer as 4xxx close frames, which a
//! pre-upgrade HTTP rejection could not carry. Each socket gets a writer
//! task fed by the connection's outbound channel; the reader loop feeds
//! messages into the chat core. The endpoint library reunites fragmented
//! messages before this loop sees them, so every frame here is a whole
//! envelope and the size cap in `on_frame` applies to the assembled length.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        RawQuery, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::chat::{ChatServer, STATUS_NORMAL};
use crate::registry::Outbound;

/// GET `<server.endpoint>` (WebSocket upgrade).
pub async fn chat_upgrade(
    ws: WebSocketUpgrade,
    State(chat): State<Arc<ChatServer>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, chat, headers, query))
}

async fn handle_socket(socket: WebSocket, chat: Arc<ChatServer>, headers: HeaderMap, query: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // writer: drains the outbound channel; a close frame ends it
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Ping => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let conn = match chat.on_connected(&query, &headers, tx.clone()).await {
        Ok(conn) => conn,
        Err((code, reason)) => {
            debug!(code, reason = %reason, "rejecting upgrade");
            let _ = tx.send(Outbound::Close { code, reason });
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let idle_timeout = chat.options().idle_timeout;
    let mut close_status: (u16, String) = (1006, "abnormal closure".to_string());

    loop {
        let next = match idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    conn.send_close(STATUS_NORMAL, "idle timeout");
                    close_status = (STATUS_NORMAL, "idle timeout".to_string());
                    break;
                }
            },
            None => stream.next().await,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if let Err((code, reason)) = chat.on_frame(&conn, text.as_bytes()) {
                    conn.send_close(code, &reason);
                    close_status = (code, reason);
                    break;
                }
            }
            Some(Ok(Message::Binary(bytes))) => {
                if let Err((code, reason)) = chat.on_frame(&conn, &bytes) {
                    conn.send_close(code, &reason);
                    close_status = (code, reason);
                    break;
                }
            }
            Some(Ok(Message::Pong(_))) => {
                chat.registry().mark_pong_received(conn.conn_id());
            }
            Some(Ok(Message::Ping(_))) => {
                // the endpoint library answers pings itself
            }
            Some(Ok(Message::Close(frame))) => {
                if let Some(frame) = frame {
                    close_status = (frame.code, frame.reason.to_string());
                } else {
                    close_status = (STATUS_NORMAL, String::new());
                }
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "connection error");
                break;
            }
            None => break,
        }
    }

    chat.on_disconnected(&conn, close_status.0, &close_status.1);

    // the registry no longer holds a sender for this socket, so the writer
    // drains and exits once our handles drop
    drop(conn);
    drop(tx);
    let _ = writer.await;
}
