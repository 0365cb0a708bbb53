//! Duplex (WebSocket) client transport.
//!
//! Binary frames carry resize reports, file uploads, and raw terminal
//! input (first-byte discrimination, see the protocol module); text
//! frames carry JSON control messages. The first server payload for a
//! client joining a pre-existing session is a screen snapshot.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::{self, BinaryFrame, ClientControl, ServerMessage, TermSize};
use crate::session::{ClientSink, Session, SessionRegistry};

/// How long to wait for the client's early resize frame before falling
/// back to the default size.
const EARLY_RESIZE_WAIT: Duration = Duration::from_millis(1000);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub assistant: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(registry): State<Arc<SessionRegistry>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, query.assistant, registry))
}

/// Send an explanatory text frame and close; used for pre-attach errors.
async fn close_with_error(mut socket: WebSocket, reason: String) {
    warn!(reason = %reason, "closing duplex connection");
    let _ = socket.send(Message::Text(format!("Error: {reason}"))).await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn handle_socket(
    socket: WebSocket,
    session_id: String,
    assistant: Option<String>,
    registry: Arc<SessionRegistry>,
) {
    if !protocol::valid_session_id(&session_id) {
        close_with_error(socket, format!("invalid session id: {session_id}")).await;
        return;
    }
    let assistant = assistant.unwrap_or_default();
    let (session, was_new) = match registry.lookup_or_create(&session_id, &assistant).await {
        Ok(pair) => pair,
        Err(e) => {
            close_with_error(socket, e.to_string()).await;
            return;
        }
    };

    let (sink, mut stream) = socket.split();
    let sink: ClientSink = Arc::new(Mutex::new(sink));

    // The front-end reports its window size right after connecting; use
    // it as this client's initial size so the first negotiation does not
    // go through the default. Any other early frame is replayed into the
    // normal dispatch below.
    let mut initial_size = TermSize::DEFAULT;
    let mut pending: Option<Message> = None;
    match tokio::time::timeout(EARLY_RESIZE_WAIT, stream.next()).await {
        Ok(Some(Ok(msg))) => {
            let resize = match &msg {
                Message::Binary(data) => match protocol::parse_binary_frame(data) {
                    BinaryFrame::Resize(size) => Some(size),
                    _ => None,
                },
                _ => None,
            };
            match resize {
                Some(size) => initial_size = size,
                None => pending = Some(msg),
            }
        }
        Ok(Some(Err(_))) | Ok(None) => return,
        Err(_) => {}
    }

    let client_id = session
        .attach_duplex(sink.clone(), initial_size, !was_new)
        .await;
    if was_new {
        Session::spawn_output_pump(session.clone());
    }
    info!(
        session_id = %session.id,
        client = client_id,
        assistant = %session.assistant.name,
        new_session = was_new,
        "duplex client connected"
    );

    if let Some(msg) = pending {
        if !dispatch(&session, &registry, &sink, client_id, msg).await {
            session.detach_duplex(client_id).await;
            return;
        }
    }

    loop {
        match stream.next().await {
            Some(Ok(msg)) => {
                if !dispatch(&session, &registry, &sink, client_id, msg).await {
                    break;
                }
            }
            Some(Err(e)) => {
                debug!(session_id = %session.id, client = client_id, error = %e, "socket error");
                break;
            }
            None => break,
        }
    }

    session.detach_duplex(client_id).await;
    info!(session_id = %session.id, client = client_id, "duplex client disconnected");
}

/// Handle one client frame. Returns false when the connection is done.
async fn dispatch(
    session: &Arc<Session>,
    registry: &Arc<SessionRegistry>,
    sink: &ClientSink,
    client_id: u64,
    msg: Message,
) -> bool {
    match msg {
        Message::Binary(data) => match protocol::parse_binary_frame(&data) {
            BinaryFrame::Resize(size) => {
                session.update_duplex_size(client_id, size).await;
                true
            }
            BinaryFrame::Upload(body) => {
                handle_upload(session, registry, sink, body).await;
                true
            }
            BinaryFrame::Input(bytes) => {
                if let Err(e) = session.write_input(bytes).await {
                    // The child may be mid-restart; the connection stays up.
                    warn!(session_id = %session.id, error = %e, "input write failed");
                }
                true
            }
        },
        Message::Text(text) => {
            handle_control(session, sink, &text).await;
            true
        }
        Message::Close(_) => false,
        Message::Ping(_) | Message::Pong(_) => true,
    }
}

async fn handle_control(session: &Arc<Session>, sink: &ClientSink, text: &str) {
    match protocol::parse_client_control(text) {
        Some(ClientControl::Ping { data }) => {
            let pong = ServerMessage::Pong { data };
            session
                .send_to(sink, Message::Text(pong.to_json()))
                .await;
        }
        Some(ClientControl::Chat { user_name, text }) => {
            let chat = ServerMessage::Chat {
                user_name,
                text,
                timestamp: Utc::now().to_rfc3339(),
            };
            session.broadcast_control(&chat).await;
        }
        Some(ClientControl::Other(kind)) => {
            debug!(session_id = %session.id, kind = %kind, "ignoring control message");
        }
        None => {
            debug!(session_id = %session.id, "ignoring malformed text frame");
        }
    }
}

/// Store an uploaded file and tell the client how it went; on success
/// the stored file's absolute path goes to the child as terminal input.
async fn handle_upload(
    session: &Arc<Session>,
    registry: &Arc<SessionRegistry>,
    sink: &ClientSink,
    body: &[u8],
) {
    let uploads_dir = registry.uploads_dir.clone();
    let body = body.to_vec();
    let result =
        tokio::task::spawn_blocking(move || crate::upload::save_upload(&uploads_dir, &body)).await;

    let reply = match result {
        Ok(Ok(stored)) => {
            let path = stored.absolute_path.display().to_string();
            if let Err(e) = session.write_input(path.as_bytes()).await {
                warn!(session_id = %session.id, error = %e, "failed to feed upload path to child");
            }
            ServerMessage::FileUpload {
                success: true,
                filename: Some(stored.filename),
                error: None,
            }
        }
        Ok(Err(e)) => {
            warn!(session_id = %session.id, error = %e, "upload rejected");
            ServerMessage::FileUpload {
                success: false,
                filename: None,
                error: Some(e.to_string()),
            }
        }
        Err(e) => ServerMessage::FileUpload {
            success: false,
            filename: None,
            error: Some(e.to_string()),
        },
    };
    session.send_to(sink, Message::Text(reply.to_json())).await;
}
