// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP and WebSocket edge of the terminal substrate.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::ErrorKind;
use crate::manager::SessionManager;
use crate::sendbuf::SendBuffer;

/// Shared state behind every handler.
pub struct Store {
    pub manager: Arc<SessionManager>,
    pub sendbuf: Arc<SendBuffer>,
    pub config: Arc<Config>,
}

/// Structured JSON error body shared by HTTP and WS close reasons.
pub fn error_response(kind: ErrorKind, message: impl Into<String>) -> Response {
    let status = axum::http::StatusCode::from_u16(kind.http_status())
        .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(serde_json::json!({
        "error": { "code": kind.as_str(), "message": message.into() }
    }));
    (status, body).into_response()
}

pub fn error_from(e: &anyhow::Error) -> Response {
    error_response(crate::error::kind_of(e), format!("{e:#}"))
}

/// Gate: every terminal route 503s until reconciliation has completed.
/// This is the second half of the startup-ordering defence; the first is
/// that `run` only flips the flag after the reconcile pass returns.
async fn reconcile_gate(State(store): State<Arc<Store>>, request: Request, next: Next) -> Response {
    if store.manager.is_reconciling() {
        return error_response(ErrorKind::NotReady, "session reconciliation in progress");
    }
    next.run(request).await
}

/// Build the substrate router.
pub fn build_router(store: Arc<Store>) -> Router {
    let terminals = Router::new()
        .route("/terminals", post(routes::create_terminal).get(routes::list_terminals))
        .route("/terminals/{id}", get(routes::get_terminal).delete(routes::delete_terminal))
        .route("/terminals/{id}/resize", post(routes::resize_terminal))
        .route("/terminals/{id}/signal", post(routes::signal_terminal))
        .route("/terminals/{id}/message", post(routes::message_terminal))
        .route("/terminals/{id}/output", get(routes::terminal_output))
        .route("/terminals/{id}/stream", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(Arc::clone(&store), reconcile_gate));

    Router::new()
        .route("/healthz", get(routes::healthz))
        .merge(terminals)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(store)
}
