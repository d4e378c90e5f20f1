// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal WebSocket: one viewer attached to one session.
//!
//! The first connection for a session key creates the session; later
//! connections with the same key reattach and receive scrollback replay.
//! Process output goes out as binary frames, control frames as JSON text.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ApiError, ErrorCode};
use crate::manager::TerminalRequest;
use crate::session::frame::{ClientFrame, ControlFrame, Inbound};
use crate::session::viewer::{Outbound, ViewerSink};
use crate::session::{is_server_session_id, Session, SessionKind};
use crate::transport::state::AppState;

/// Handshake parameters of a terminal connection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TerminalQuery {
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default, alias = "initialCommand")]
    pub initial_command: Option<String>,
    #[serde(default, alias = "taskNo")]
    pub task_no: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// `GET /ws/terminal`
pub async fn terminal_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(state, socket, query))
}

/// `GET /ws/terminal/{session_id}`; the path id wins over the query.
pub async fn terminal_ws_for(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(mut query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    query.session_id = Some(session_id);
    ws.on_upgrade(move |socket| handle_connection(state, socket, query))
}

async fn handle_connection(state: Arc<AppState>, socket: WebSocket, query: TerminalQuery) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sink, mut outbound) = ViewerSink::channel();
    let viewer_id = sink.id();

    let session = match open_session(&state, query, sink) {
        Ok(session) => session,
        Err(err) => {
            debug!(code = err.code.as_str(), message = %err.message, "terminal connection refused");
            let frame = ControlFrame::Error {
                code: err.code.as_str().to_owned(),
                message: err.message,
            };
            let _ = ws_tx.send(Message::Text(frame.to_json().into())).await;
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = outbound.recv() => {
                let msg = match frame {
                    Some(Outbound::Data(data)) => Message::Binary(data),
                    Some(Outbound::Control(control)) => Message::Text(control.to_json().into()),
                    // Dropped as too slow, or the session was destroyed.
                    None => break,
                };
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                handle_inbound(&state, &session, Inbound::decode(data));
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    state.registry.detach_viewer(&session, viewer_id);
}

/// Attach `sink` to the requested session, creating it on first contact.
fn open_session(
    state: &AppState,
    query: TerminalQuery,
    sink: ViewerSink,
) -> Result<Arc<Session>, ApiError> {
    let id = query.session_id.filter(|id| !id.is_empty());

    if let Some(ref id) = id {
        if let Some(session) = state.registry.attach_viewer(id, sink.clone()) {
            return Ok(session);
        }
        // Server sessions come from the start workflow only.
        if is_server_session_id(id) || (query.cwd.is_none() && query.task_no.is_none()) {
            return Err(ErrorCode::SessionNotFound.with(format!("no session {id}")));
        }
    }

    let session = state.manager.create_terminal(TerminalRequest {
        session_id: id,
        cwd: query.cwd,
        initial_command: query.initial_command,
        task_no: query.task_no,
        name: query.name,
    })?;
    state.registry.attach_viewer(session.id(), sink).ok_or_else(|| {
        ErrorCode::SessionNotFound.with(format!("session {} went away", session.id()))
    })
}

fn handle_inbound(state: &AppState, session: &Arc<Session>, inbound: Inbound) {
    match inbound {
        Inbound::Input(data) => session.write(data),
        Inbound::Control(ClientFrame::Resize { cols, rows }) => {
            if cols > 0 && rows > 0 {
                session.resize(cols, rows);
            }
        }
        Inbound::Control(ClientFrame::Kill) => match session.kind() {
            SessionKind::Terminal => state.registry.destroy_session(session),
            SessionKind::Server => {
                debug!(session_id = %session.id(), "ignoring kill for server session");
            }
        },
        Inbound::Control(ClientFrame::Clear) => session.clear_scrollback(),
    }
}
