//! WebSocket front end: admission, origin validation, and the serve loop.
//!
//! Rejections happen before the upgrade completes, in the admission
//! policy's order: the once/max-clients rules, then the path (the router
//! itself), then the origin rule. A refused client fails the HTTP
//! handshake and no session task ever exists for it. Everything after
//! the upgrade belongs to [`crate::session`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::protocol;
use crate::registry::{AdmitError, SessionRegistry};
use crate::session;

/// Shared state for the axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: SessionRegistry,
}

/// Rejections surfaced before the WebSocket upgrade.
#[derive(Debug)]
pub enum ServeError {
    /// 403 - `Origin` does not match `Host` (with `--check-origin`).
    OriginNotAllowed,
    /// 503 - admission policy refused the client.
    Refused(AdmitError),
}

impl ServeError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServeError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ServeError::Refused(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn message(&self) -> String {
        match self {
            ServeError::OriginNotAllowed => "origin not allowed".to_string(),
            ServeError::Refused(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message() });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Build the application router: one WebSocket endpoint with request
/// tracing around it. Any other path falls through to a 404 without
/// consulting the admission checks.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(protocol::WS_PATH, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C or, in `--once` mode, until the single permitted
/// session has come and gone.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
) -> std::io::Result<()> {
    let shutdown = shutdown_signal(state.clone());
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn shutdown_signal(state: AppState) {
    let exit = state.registry.exit_signal();
    tokio::select! {
        _ = exit.cancelled() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
            }
            tracing::info!("shutting down, closing live sessions");
            state.registry.shutdown_all();
        }
    }
}

/// True when the request's `Origin` matches its `Host`. Browsers attach
/// `Origin` to every WebSocket handshake, so a missing header fails the
/// check too.
fn origin_allowed(headers: &HeaderMap) -> bool {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    let host = headers.get("host").and_then(|v| v.to_str().ok());
    match (origin, host) {
        (Some(origin), Some(host)) => host_origin_matches(origin, host),
        _ => false,
    }
}

/// Compare an `Origin` value against the `Host` header the way the
/// browser formats them: the scheme-default ports 80/443 are dropped from
/// the origin, any other port must appear textually, and the comparison
/// is case-insensitive.
fn host_origin_matches(origin: &str, host: &str) -> bool {
    let Some((scheme, rest)) = origin.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    if authority.is_empty() {
        return false;
    }

    let default_port = if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss")
    {
        443
    } else {
        80
    };
    let (address, port) = match authority.rsplit_once(':') {
        Some((address, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            match port.parse::<u16>() {
                Ok(port) => (address, port),
                Err(_) => return false,
            }
        }
        _ => (authority, default_port),
    };

    let expected = if port == 80 || port == 443 {
        address.to_string()
    } else {
        format!("{address}:{port}")
    };
    expected.eq_ignore_ascii_case(host)
}

/// Admission filter plus upgrade. The checks run in the policy's order:
/// the once/max-clients verdict first, the origin rule last, so a client
/// refused for capacity reasons is told so even when its origin is also
/// wrong. A slot refused here is released on the spot; the `--once`
/// budget is only consumed once a session actually establishes.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ServeError> {
    let guard = state.registry.admit(peer).map_err(|e| {
        tracing::warn!(%peer, error = %e, "refusing WS client");
        ServeError::Refused(e)
    })?;

    if state.config.check_origin && !origin_allowed(&headers) {
        tracing::warn!(%peer, "refusing WS client from a different origin");
        // Dropping the guard refunds the reserved slot.
        return Err(ServeError::OriginNotAllowed);
    }

    let config = state.config.clone();
    Ok(ws
        .protocols([protocol::WS_SUBPROTOCOL])
        .max_message_size(protocol::MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| session::run(socket, config, guard)))
}
