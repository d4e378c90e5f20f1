// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log WebSocket: streams a task's server log file.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ErrorCode;
use crate::logtail::{LogTail, TailCommand, TailEvent};
use crate::session::frame::{ClientFrame, ControlFrame, Inbound};
use crate::transport::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default, alias = "taskNo")]
    pub task_no: Option<String>,
}

/// `GET /ws/logs?task_no=..`
pub async fn logs_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(task_no) = query.task_no else {
        return ErrorCode::BadRequest.with("task_no is required").into_response();
    };
    let path = match state.manager.log_path(&task_no) {
        Ok(path) => path,
        Err(err) => return err.into_response(),
    };
    let tail = LogTail::open(path, state.logs.backlog_bytes)
        .with_poll_interval(state.logs.poll_interval);
    ws.on_upgrade(move |socket| handle_connection(state, socket, tail))
}

async fn handle_connection(state: Arc<AppState>, socket: WebSocket, tail: LogTail) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (events_tx, mut events) = mpsc::channel(64);
    let (commands, commands_rx) = mpsc::channel(4);
    let stop = state.shutdown.child_token();
    debug!(path = %tail.path().display(), "log viewer attached");
    let tail_task = tokio::spawn(tail.run(events_tx, commands_rx, stop.clone()));

    loop {
        tokio::select! {
            event = events.recv() => {
                let msg = match event {
                    Some(TailEvent::Data(data)) => Message::Binary(data),
                    Some(TailEvent::Cleared) => Message::Text(ControlFrame::LogCleared.to_json().into()),
                    Some(TailEvent::NoFile) => Message::Text(ControlFrame::LogNoFile.to_json().into()),
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
                // Only `clear` means anything on a log stream.
                if Inbound::decode(data) == Inbound::Control(ClientFrame::Clear)
                    && commands.send(TailCommand::Clear).await.is_err()
                {
                    break;
                }
            }
        }
    }

    stop.cancel();
    drop(commands);
    let _ = tail_task.await;
    let _ = ws_tx.send(Message::Close(None)).await;
}
