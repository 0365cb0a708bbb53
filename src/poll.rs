//! Long-poll client transport.
//!
//! Two idempotent endpoints per session/client pair: `poll` pulls a
//! base64 snapshot of the current screen, `send` pushes input or a
//! resize. Polling clients coexist with duplex clients in the same
//! session and take part in size negotiation; they are evicted once
//! their last poll is older than the staleness threshold.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::protocol::{self, PollResponse, SendRequest, TermSize};
use crate::server::ApiError;
use crate::session::{Session, SessionError, SessionRegistry};

/// Bound on the wait for a fresh session's first visible output.
const INITIAL_CONTENT_WAIT: Duration = Duration::from_secs(4);

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub assistant: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::UnknownAssistant(name) => {
                ApiError::BadRequest(format!("unknown assistant: {name}"))
            }
            SessionError::SpawnFailure(e) => ApiError::Internal(e.to_string()),
        }
    }
}

/// `GET /session/{uuid}/client/{clientId}/poll`
///
/// Registers the polling client on first use, refreshes it afterwards,
/// and returns the current screen plus session status.
pub async fn poll_handler(
    Path((session_id, client_id)): Path<(String, String)>,
    Query(query): Query<PollQuery>,
    State(registry): State<Arc<SessionRegistry>>,
) -> Result<Json<PollResponse>, ApiError> {
    if !protocol::valid_session_id(&session_id) {
        return Err(ApiError::BadRequest(format!(
            "invalid session id: {session_id}"
        )));
    }
    let assistant = query.assistant.unwrap_or_default();
    let (session, was_new) = registry.lookup_or_create(&session_id, &assistant).await?;

    if was_new {
        Session::spawn_output_pump(session.clone());
        // Give the assistant a moment to print its banner so the first
        // snapshot is not an empty screen.
        session.wait_for_content(INITIAL_CONTENT_WAIT).await;
        info!(
            session_id = %session.id,
            client = %client_id,
            "session created by polling client"
        );
    }

    let size = match (query.rows, query.cols) {
        (Some(rows), Some(cols)) => Some(TermSize::clamped(rows, cols)),
        _ => None,
    };
    session.touch_polling(&client_id, size).await;

    let snapshot = session.snapshot();
    let (viewers, applied) = session.status().await;
    Ok(Json(PollResponse {
        terminal: BASE64.encode(snapshot),
        viewers,
        cols: applied.cols,
        rows: applied.rows,
        assistant: session.assistant.display_name.clone(),
    }))
}

/// `POST /session/{uuid}/client/{clientId}/send`
///
/// Accepts `{type: "input"|"resize", data}`. Input is paced one byte at
/// a time for the benefit of TUIs that choke on pasted-speed input.
pub async fn send_handler(
    Path((session_id, client_id)): Path<(String, String)>,
    State(registry): State<Arc<SessionRegistry>>,
    Json(request): Json<SendRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = registry
        .lookup(&session_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("no session {session_id}")))?;

    if !session.polling_known(&client_id).await {
        return Err(ApiError::BadRequest(
            "client has never polled this session".to_string(),
        ));
    }

    match request.kind.as_str() {
        "input" => {
            debug!(
                session_id = %session.id,
                client = %client_id,
                bytes = request.data.len(),
                "polling input"
            );
            session
                .write_input_paced(request.data.as_bytes())
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        "resize" => {
            let size = protocol::parse_resize_data(&request.data).ok_or_else(|| {
                ApiError::BadRequest(format!("bad resize payload: {:?}", request.data))
            })?;
            session.resize_polling(&client_id, size).await;
        }
        other => {
            return Err(ApiError::BadRequest(format!("unknown send type: {other}")));
        }
    }

    Ok(Json(json!({ "success": true })))
}
