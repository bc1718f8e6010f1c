// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket terminal stream.
//!
//! Hybrid binary framing for browser clients: a message whose first byte
//! is 0x00 carries control JSON; 0x01 carries raw terminal bytes. Clients
//! that can set upgrade headers may send `X-Session-Resume: <seq>` to skip
//! the full ring replay and receive only frames with seq > N.
//!
//! The welcome control message carries the seq high-water mark covered by
//! the replay. Per-subscriber delivery is in-order and contiguous, so a
//! client derives the seq of every later data message by counting.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ErrorKind;
use crate::session::{Session, SubscriberEvent};

use super::{error_response, Store};

/// First byte of a control message (JSON follows).
pub const WS_CONTROL: u8 = 0x00;
/// First byte of a data message (raw bytes follow).
pub const WS_DATA: u8 = 0x01;

/// The resume header carried by non-browser clients.
pub const RESUME_HEADER: &str = "x-session-resume";

/// Control messages from the client.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    Resize { cols: u16, rows: u16 },
    Ping,
}

/// Control messages to the client.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerControl {
    /// Sent once on connect, before replay data.
    Welcome { session: String, seq: u64 },
    Pong,
    Exit { code: Option<i32>, signal: Option<String> },
}

/// Frame a control message.
pub fn control_frame(control: &ServerControl) -> Vec<u8> {
    let mut frame = vec![WS_CONTROL];
    if let Ok(json) = serde_json::to_vec(control) {
        frame.extend_from_slice(&json);
    }
    frame
}

/// Frame a data message.
pub fn data_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + data.len());
    frame.push(WS_DATA);
    frame.extend_from_slice(data);
    frame
}

/// Split an inbound binary message into (kind, payload).
pub fn parse_frame(raw: &[u8]) -> Option<(u8, &[u8])> {
    let (&kind, payload) = raw.split_first()?;
    Some((kind, payload))
}

/// `GET /terminals/{id}/stream` upgrade handler.
pub async fn ws_handler(
    State(store): State<Arc<Store>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(session) = store.manager.get(&id) else {
        return error_response(ErrorKind::NotFound, format!("no session {id}"));
    };

    let resume = headers
        .get(RESUME_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    ws.on_upgrade(move |socket| handle_stream(session, resume, socket)).into_response()
}

async fn handle_stream(session: Arc<Session>, resume: Option<u64>, socket: WebSocket) {
    let mut attachment = session.attach(resume);
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Welcome, then replay, then live — in that order, on one queue.
    let welcome = ServerControl::Welcome {
        session: session.meta.id.clone(),
        seq: attachment.replay_seq,
    };
    if ws_tx.send(Message::Binary(control_frame(&welcome).into())).await.is_err() {
        session.detach(attachment.subscriber_id);
        return;
    }
    for chunk in &attachment.replay {
        if ws_tx.send(Message::Binary(data_frame(&chunk.data).into())).await.is_err() {
            session.detach(attachment.subscriber_id);
            return;
        }
    }

    loop {
        tokio::select! {
            event = attachment.events.recv() => {
                match event {
                    Some(SubscriberEvent::Data(chunk)) => {
                        if ws_tx.send(Message::Binary(data_frame(&chunk.data).into())).await.is_err() {
                            break;
                        }
                    }
                    Some(SubscriberEvent::Exit(exit)) => {
                        let control = ServerControl::Exit { code: exit.code, signal: exit.signal };
                        let _ = ws_tx.send(Message::Binary(control_frame(&control).into())).await;
                        break;
                    }
                    // Dropped by the session (overflow) or session closed.
                    None => break,
                }
            }

            inbound = ws_rx.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(_)) | None => break,
                };
                match message {
                    Message::Binary(raw) => {
                        if handle_inbound(&session, &raw, &mut ws_tx).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Text frames are not part of the protocol; axum
                    // answers protocol-level pings itself.
                    _ => {}
                }
            }
        }
    }

    session.detach(attachment.subscriber_id);
}

async fn handle_inbound(
    session: &Arc<Session>,
    raw: &[u8],
    ws_tx: &mut (impl SinkExt<Message> + Unpin),
) -> Result<(), ()> {
    let Some((kind, payload)) = parse_frame(raw) else {
        return Ok(());
    };

    match kind {
        WS_DATA => {
            let bytes = Bytes::copy_from_slice(payload);
            if session.write(bytes, true).await.is_err() {
                return Err(());
            }
        }
        WS_CONTROL => match serde_json::from_slice::<ClientControl>(payload) {
            Ok(ClientControl::Resize { cols, rows }) => {
                let _ = session.resize(cols, rows).await;
            }
            Ok(ClientControl::Ping) => {
                let frame = control_frame(&ServerControl::Pong);
                if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                    return Err(());
                }
            }
            Err(e) => debug!("ignoring malformed ws control: {e}"),
        },
        other => debug!("ignoring unknown ws frame kind {other:#04x}"),
    }
    Ok(())
}
