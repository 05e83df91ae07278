//! WebSocket server over the chat services.
//!
//! One TCP listener; each accepted connection is sniffed for a WebSocket
//! upgrade and otherwise answered as plain HTTP (`/healthz` for probes).
//! A WebSocket client introduces itself with a `hello` frame naming a room
//! or an invite code, gets a `welcome` snapshot, then exchanges frames while
//! the server forwards that room's events as they happen.
//!
//! Frames, client to server: `hello`, `send`, `typing`, `page`, `ping`.
//! Server to client: `welcome`, `history`, `lagged`, `error`, `pong`, plus
//! every [`RoomEvent`] serialized as-is.

use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::IntervalStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelSignal, RoomEvent};
use crate::error::{ChatError, ChatResult};
use crate::messages::ChatMessage;
use crate::presence::PresenceEntry;
use crate::rooms::Room;
use crate::{Chat, Session};

static STARTED: Lazy<Instant> = Lazy::new(Instant::now);

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection. Exactly one of `room_id` or
    /// `invite_code` selects the room; a missing `user_id` gets a fresh one.
    Hello {
        #[serde(default)]
        user_id: Option<Uuid>,
        display_name: String,
        #[serde(default)]
        room_id: Option<Uuid>,
        #[serde(default)]
        invite_code: Option<String>,
    },
    Send {
        content: String,
    },
    Typing,
    Page {
        #[serde(default)]
        before_id: Option<Uuid>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        room: Room,
        you: Session,
        /// Whether this hello created the membership row.
        joined: bool,
        roster: Vec<PresenceEntry>,
        recent: Vec<ChatMessage>,
    },
    History {
        messages: Vec<ChatMessage>,
    },
    /// The connection fell behind the room channel; `missed` events were
    /// dropped. The client should refetch its tail.
    Lagged {
        missed: u64,
    },
    Error {
        code: &'static str,
        message: String,
    },
    Pong,
}

fn error_frame(e: &ChatError) -> ServerFrame {
    ServerFrame::Error { code: e.code(), message: e.to_string() }
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Bind and serve until the process dies.
pub async fn serve(chat: Chat, bind: &str, port: u16) -> ChatResult<()> {
    let listener = TcpListener::bind(format!("{bind}:{port}")).await?;
    serve_on(chat, listener).await
}

/// Accept loop over an already-bound listener. Also owns the presence
/// sweeper.
pub async fn serve_on(chat: Chat, listener: TcpListener) -> ChatResult<()> {
    Lazy::force(&STARTED);
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "chat server listening");
    }

    let presence = chat.presence.clone();
    let sweep = Duration::from_secs(chat.config.presence.sweep_secs.max(1));
    tokio::spawn(async move {
        let mut ticks = IntervalStream::new(tokio::time::interval(sweep));
        while ticks.next().await.is_some() {
            let evicted = presence.prune_stale();
            if evicted > 0 {
                debug!(evicted, "presence sweep evicted silent connections");
            }
        }
    });

    loop {
        let (stream, addr) = listener.accept().await?;
        let chat = chat.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, chat).await {
                debug!(%addr, error = %e, "connection ended with error");
            }
        });
    }
}

/// Peek the request head without consuming it, then route: WebSocket
/// upgrades go to the session loop, anything else gets a plain HTTP answer.
async fn handle_connection(stream: TcpStream, chat: Chat) -> ChatResult<()> {
    let mut head = [0u8; 1024];
    let n = stream.peek(&mut head).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let _ = req.parse(&head[..n]);
    let path = req.path.unwrap_or("/").to_string();
    let upgrade = req.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("upgrade")
            && String::from_utf8_lossy(h.value).eq_ignore_ascii_case("websocket")
    });

    if upgrade {
        match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => handle_ws(ws, chat).await,
            Err(e) => debug!(error = %e, "websocket handshake failed"),
        }
        return Ok(());
    }

    let mut stream = stream;
    let response = match path.as_str() {
        "/healthz" => {
            let body = serde_json::json!({
                "status": "ok",
                "uptime_secs": STARTED.elapsed().as_secs(),
            })
            .to_string();
            http_response("200 OK", "application/json", &body)
        }
        "/" => http_response(
            "200 OK",
            "text/plain",
            concat!("salon-chat ", env!("CARGO_PKG_VERSION"), "\n"),
        ),
        _ => http_response("404 Not Found", "text/plain", "not found\n"),
    };
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

async fn handle_ws(ws: WebSocketStream<TcpStream>, chat: Chat) {
    let (mut sink, mut source) = ws.split();

    // The hello must arrive first, and promptly.
    let hello_window = Duration::from_millis(chat.config.server.hello_timeout_ms.max(1));
    let hello = tokio::time::timeout(hello_window, async {
        loop {
            match source.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Hello { user_id, display_name, room_id, invite_code }) => {
                            return Some((user_id, display_name, room_id, invite_code));
                        }
                        _ => {
                            let frame = ServerFrame::Error {
                                code: "expected_hello",
                                message: "first frame must be hello".to_string(),
                            };
                            if !send_json(&mut sink, &frame).await {
                                return None;
                            }
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;

    let hello = match hello {
        Ok(hello) => hello,
        Err(_) => {
            debug!("hello deadline elapsed");
            let frame = ServerFrame::Error {
                code: "expected_hello",
                message: "no hello within the handshake window".to_string(),
            };
            let _ = send_json(&mut sink, &frame).await;
            return;
        }
    };
    let Some((user_id, display_name, room_id, invite_code)) = hello else {
        debug!("connection dropped before hello");
        return;
    };

    let display_name = display_name.trim().to_string();
    if display_name.is_empty() {
        let _ = send_json(&mut sink, &error_frame(&ChatError::EmptyContent)).await;
        return;
    }
    let session = Session::new(user_id.unwrap_or_else(Uuid::new_v4), display_name);

    let attached = match (room_id, invite_code) {
        (Some(_), Some(_)) => Err(ChatError::Config(
            "hello must carry exactly one of room_id and invite_code".to_string(),
        )),
        (None, Some(code)) => chat
            .gate
            .join_by_invite_code(&session, &code)
            .and_then(|outcome| {
                let room = chat.gate.room(outcome.membership().room_id)?;
                Ok((room, outcome.is_new()))
            }),
        (Some(id), None) => chat.gate.room(id).and_then(|room| {
            if room.is_public() {
                let outcome = chat.gate.enter_public(&session, room.id)?;
                Ok((room, outcome.is_new()))
            } else if chat.gate.can_read(&session, &room)? {
                Ok((room, false))
            } else {
                Err(ChatError::Forbidden)
            }
        }),
        (None, None) => Err(ChatError::Config(
            "hello must carry room_id or invite_code".to_string(),
        )),
    };

    let (room, joined) = match attached {
        Ok(pair) => pair,
        Err(e) => {
            let _ = send_json(&mut sink, &error_frame(&e)).await;
            return;
        }
    };

    // Subscribe before the snapshot so nothing falls between them.
    let mut sub = match chat.hub.subscribe(room.id) {
        Ok(sub) => sub,
        Err(e) => {
            let _ = send_json(&mut sink, &error_frame(&e)).await;
            return;
        }
    };
    let conn_id = Uuid::new_v4();
    chat.presence.connect(room.id, conn_id, &session);

    let recent = chat
        .log
        .page(room.id, None, chat.log.default_page_size())
        .unwrap_or_default();
    let welcome = ServerFrame::Welcome {
        room: room.clone(),
        you: session.clone(),
        joined,
        roster: chat.presence.roster(room.id),
        recent,
    };
    if !send_json(&mut sink, &welcome).await {
        chat.presence.disconnect(room.id, conn_id);
        return;
    }
    info!(conn = %conn_id, user = %session.user_id, room = %room.id, "client attached");

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    chat.presence.touch(room.id, conn_id);
                    let ok = handle_frame(&chat, &session, &room, &text, &mut sink).await;
                    if !ok {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            signal = sub.recv() => match signal {
                ChannelSignal::Event(event) => {
                    if !send_json(&mut sink, &event).await {
                        break;
                    }
                }
                ChannelSignal::Lagged(missed) => {
                    warn!(conn = %conn_id, missed, "client fell behind room channel");
                    if !send_json(&mut sink, &ServerFrame::Lagged { missed }).await {
                        break;
                    }
                }
                ChannelSignal::Closed => break,
            },
        }
    }

    chat.presence.disconnect(room.id, conn_id);
    debug!(conn = %conn_id, "client detached");
}

/// Handle one post-hello frame. Returns false when the connection is dead.
async fn handle_frame(
    chat: &Chat,
    session: &Session,
    room: &Room,
    text: &str,
    sink: &mut SplitSink<WebSocketStream<TcpStream>, WsMessage>,
) -> bool {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(_) => {
            debug!("ignoring unparseable frame");
            return true;
        }
    };
    match frame {
        ClientFrame::Send { content } => {
            match chat.log.append(session, room.id, &content) {
                // The author hears about it through the room echo.
                Ok(_) => true,
                Err(e) => send_json(sink, &error_frame(&e)).await,
            }
        }
        ClientFrame::Typing => {
            chat.hub.publish(
                room.id,
                RoomEvent::Typing {
                    user_id: session.user_id,
                    display_name: session.display_name.clone(),
                },
            );
            true
        }
        ClientFrame::Page { before_id, limit } => {
            let limit = limit.unwrap_or_else(|| chat.log.default_page_size());
            match chat.log.page(room.id, before_id, limit) {
                Ok(messages) => send_json(sink, &ServerFrame::History { messages }).await,
                Err(e) => send_json(sink, &error_frame(&e)).await,
            }
        }
        ClientFrame::Ping => send_json(sink, &ServerFrame::Pong).await,
        ClientFrame::Hello { .. } => {
            let frame = ServerFrame::Error {
                code: "already_attached",
                message: "hello is only valid once".to_string(),
            };
            send_json(sink, &frame).await
        }
    }
}

async fn send_json<T: Serialize>(
    sink: &mut SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    value: &T,
) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => sink.send(WsMessage::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "frame serialization failed");
            true
        }
    }
}
