//! HTTP surface: router assembly, session pages, CA certificate
//! download, embedded static assets, and graceful shutdown.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::session::SessionRegistry;
use crate::{poll, ws};

const INDEX_HTML: &str = include_str!("../static/index.html");
const SESSION_HTML: &str = include_str!("../static/session.html");
const APP_JS: &str = include_str!("../static/app.js");
const STYLE_CSS: &str = include_str!("../static/style.css");

/// Default CA certificate location, overridden by `TLS_CERT_PATH`.
const DEFAULT_CA_PATH: &str = "certs/ca.crt";

/// Error type for the JSON API handlers.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn index_page() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Deserialize)]
struct SessionPageQuery {
    assistant: Option<String>,
}

/// Session page. Redirects to `/` when the assistant selector is absent
/// or unavailable; redirects to the session's own assistant URL when the
/// session already exists under a different one.
async fn session_page(
    Path(session_id): Path<String>,
    Query(query): Query<SessionPageQuery>,
    State(registry): State<Arc<SessionRegistry>>,
) -> Response {
    let Some(assistant) = query.assistant else {
        return Redirect::to("/").into_response();
    };
    if !registry.catalog.contains(&assistant) || !crate::protocol::valid_session_id(&session_id) {
        return Redirect::to("/").into_response();
    }
    if let Some(existing) = registry.lookup(&session_id).await {
        if existing.assistant.name != assistant {
            let target = format!(
                "/session/{}?assistant={}",
                session_id, existing.assistant.name
            );
            return Redirect::to(&target).into_response();
        }
    }
    Html(SESSION_HTML).into_response()
}

/// Serve the configured CA certificate for mobile trust installation.
/// Access control is the upstream gateway's responsibility.
async fn ca_cert() -> Response {
    let path = std::env::var("TLS_CERT_PATH").unwrap_or_else(|_| DEFAULT_CA_PATH.to_string());
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/x-x509-ca-cert"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"ca.crt\"",
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!(path = %path, error = %e, "CA certificate unavailable");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Embedded static asset tree; everything not routed elsewhere lands
/// here.
async fn static_asset(uri: Uri) -> Response {
    match uri.path() {
        "/app.js" => ([(header::CONTENT_TYPE, "application/javascript")], APP_JS).into_response(),
        "/style.css" => ([(header::CONTENT_TYPE, "text/css")], STYLE_CSS).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Accept Go-style `:9898` listen addresses by filling in the wildcard
/// host.
fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

/// Run the HTTP server until SIGINT/SIGTERM, then close every session.
pub async fn run_server(addr: &str, registry: Arc<SessionRegistry>) -> anyhow::Result<()> {
    let reaper = SessionRegistry::spawn_reaper(registry.clone());

    // CORS stays off the WebSocket route; it can interfere with the
    // upgrade handshake.
    let ws_route = Router::new().route("/ws/:session_id", get(ws::ws_handler));

    let app = Router::new()
        .route("/", get(index_page))
        .route("/session/:session_id", get(session_page))
        .route(
            "/session/:session_id/client/:client_id/poll",
            get(poll::poll_handler),
        )
        .route(
            "/session/:session_id/client/:client_id/send",
            post(poll::send_handler),
        )
        .route("/ssl/ca.crt", get(ca_cert))
        .fallback(static_asset)
        .layer(CorsLayer::permissive())
        .merge(ws_route)
        .layer(TraceLayer::new_for_http())
        .with_state(registry.clone());

    let addr = normalize_addr(addr);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on http://{addr}");
    info!("→ session pages: http://{addr}/session/{{uuid}}?assistant=NAME");
    info!("→ duplex transport: ws://{addr}/ws/{{uuid}}?assistant=NAME");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, closing sessions");
    reaper.abort();
    registry.close_all().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_in_wildcard_host() {
        assert_eq!(normalize_addr(":9898"), "0.0.0.0:9898");
        assert_eq!(normalize_addr("127.0.0.1:8080"), "127.0.0.1:8080");
    }
}
