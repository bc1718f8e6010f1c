// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal CRUD handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};

use tower_sidecar::frame::SignalName;

use crate::error::ErrorKind;
use crate::manager::{CreateSessionRequest, KillPurpose};
use crate::roles::Role;
use crate::session::Session;

use super::{error_from, error_response, Store};

#[derive(Debug, Deserialize)]
pub struct CreateTerminalBody {
    pub workspace_key: String,
    pub role: Role,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub supervised: Option<bool>,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

#[derive(Debug, Serialize)]
pub struct TerminalInfo {
    pub id: String,
    pub workspace_key: String,
    pub role: String,
    pub backend: &'static str,
    pub persistent: bool,
    pub supervised: bool,
    pub cols: u16,
    pub rows: u16,
    pub created_at: i64,
    pub last_seq: u64,
    pub subscribers: usize,
    pub disconnected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitBody>,
}

#[derive(Debug, Serialize)]
pub struct ExitBody {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl TerminalInfo {
    pub fn from_session(session: &Arc<Session>) -> Self {
        let (cols, rows) = session.dims();
        Self {
            id: session.meta.id.clone(),
            workspace_key: session.meta.workspace_key.clone(),
            role: session.meta.role.as_str().to_owned(),
            backend: session.backend_kind(),
            persistent: session.meta.persistent,
            supervised: session.meta.supervised,
            cols,
            rows,
            created_at: session.meta.created_at,
            last_seq: session.last_seq(),
            subscribers: session.subscriber_count(),
            disconnected: session.is_disconnected(),
            exit: session
                .exit_info()
                .map(|e| ExitBody { code: e.code, signal: e.signal }),
        }
    }
}

/// `GET /healthz` — liveness only. Deliberately not gated on
/// reconciliation and deliberately free of any session listing.
pub async fn healthz(State(store): State<Arc<Store>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "reconciling": store.manager.is_reconciling(),
    }))
}

/// `POST /terminals` — create a session.
pub async fn create_terminal(
    State(store): State<Arc<Store>>,
    Json(body): Json<CreateTerminalBody>,
) -> Response {
    let request = CreateSessionRequest {
        workspace_key: body.workspace_key,
        role: body.role,
        cmd: body.cmd,
        args: body.args,
        cwd: body.cwd,
        env: body.env,
        cols: body.cols,
        rows: body.rows,
        supervised: body.supervised,
    };

    match store.manager.create_session(request).await {
        Ok(session) => (
            axum::http::StatusCode::CREATED,
            Json(TerminalInfo::from_session(&session)),
        )
            .into_response(),
        Err(e) => error_from(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub workspace: Option<String>,
}

/// `GET /terminals` — list sessions from the in-memory table (the runtime
/// source of truth, never the registry).
pub async fn list_terminals(
    State(store): State<Arc<Store>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let terminals: Vec<TerminalInfo> = store
        .manager
        .list()
        .iter()
        .filter(|s| {
            query.workspace.as_deref().map(|w| s.meta.workspace_key == w).unwrap_or(true)
        })
        .map(TerminalInfo::from_session)
        .collect();
    Json(serde_json::json!({ "terminals": terminals }))
}

/// `GET /terminals/{id}`.
pub async fn get_terminal(State(store): State<Arc<Store>>, Path(id): Path<String>) -> Response {
    match store.manager.get(&id) {
        Some(session) => Json(TerminalInfo::from_session(&session)).into_response(),
        None => error_response(ErrorKind::NotFound, format!("no session {id}")),
    }
}

/// `DELETE /terminals/{id}` — permanent kill.
pub async fn delete_terminal(State(store): State<Arc<Store>>, Path(id): Path<String>) -> Response {
    match store.manager.kill_session(&id, KillPurpose::Permanent).await {
        Ok(()) => Json(serde_json::json!({ "killed": true })).into_response(),
        Err(e) => error_from(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ResizeBody {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /terminals/{id}/resize`.
pub async fn resize_terminal(
    State(store): State<Arc<Store>>,
    Path(id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Response {
    let Some(session) = store.manager.get(&id) else {
        return error_response(ErrorKind::NotFound, format!("no session {id}"));
    };
    match session.resize(body.cols, body.rows).await {
        Ok(()) => {
            let _ = store.manager.registry().update_dims(&id, body.cols, body.rows).await;
            Json(serde_json::json!({ "cols": body.cols, "rows": body.rows })).into_response()
        }
        Err(e) => error_from(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SignalBody {
    pub name: String,
}

/// `POST /terminals/{id}/signal` — allow-listed signals only.
pub async fn signal_terminal(
    State(store): State<Arc<Store>>,
    Path(id): Path<String>,
    Json(body): Json<SignalBody>,
) -> Response {
    let Some(session) = store.manager.get(&id) else {
        return error_response(ErrorKind::NotFound, format!("no session {id}"));
    };
    let name: SignalName = match body.name.parse() {
        Ok(name) => name,
        Err(e) => return error_response(ErrorKind::ConfigInvalid, format!("{e}")),
    };
    match session.signal(name).await {
        Ok(()) => Json(serde_json::json!({ "signaled": body.name })).into_response(),
        Err(e) => error_from(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub payload: String,
    #[serde(default)]
    pub interrupt: bool,
}

/// `POST /terminals/{id}/message` — typing-aware injection from external
/// collaborators. Returns `{accepted, deferred}`.
pub async fn message_terminal(
    State(store): State<Arc<Store>>,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Response {
    let session = store.manager.get(&id);
    let outcome = store
        .sendbuf
        .enqueue(session.as_ref(), &id, bytes::Bytes::from(body.payload.into_bytes()), body.interrupt)
        .await;
    Json(outcome).into_response()
}

/// `GET /terminals/{id}/output` — current ring buffer contents.
pub async fn terminal_output(State(store): State<Arc<Store>>, Path(id): Path<String>) -> Response {
    let Some(session) = store.manager.get(&id) else {
        return error_response(ErrorKind::NotFound, format!("no session {id}"));
    };
    let (data, last_seq) = session.output_snapshot();
    Json(serde_json::json!({
        "data": base64::engine::general_purpose::STANDARD.encode(data),
        "last_seq": last_seq,
    }))
    .into_response()
}
