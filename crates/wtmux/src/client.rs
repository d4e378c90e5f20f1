// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Viewer side of a terminal connection.
//!
//! A [`ViewerClient`] keeps one session key attached across transport
//! drops. Creation metadata and the bootstrap command go out with the first
//! successful connect only; every reconnect is a plain reattach, and
//! scrollback replay brings the viewer current. A reconnect to a session
//! that no longer exists gets an error frame, which ends the client.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::frame::{ClientFrame, ControlFrame};

/// Retry schedule after a lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_attempts: 10, delay: Duration::from_millis(1500) }
    }
}

/// Where and what to attach to.
#[derive(Debug, Clone, Default)]
pub struct ViewerTarget {
    /// Server base URL, e.g. `ws://127.0.0.1:3000`.
    pub base_url: String,
    pub session_id: String,
    pub cwd: Option<String>,
    pub initial_command: Option<String>,
    pub task_no: Option<String>,
    pub name: Option<String>,
}

impl ViewerTarget {
    pub fn new(base_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), session_id: session_id.into(), ..Default::default() }
    }

    /// Connection URL. Creation metadata is only included when `first`, so
    /// a reconnect can never recreate a session that has gone away.
    pub fn url(&self, first: bool) -> anyhow::Result<reqwest::Url> {
        let base = self.base_url.trim_end_matches('/');
        let mut params: Vec<(&str, &str)> = vec![("session_id", self.session_id.as_str())];
        if first {
            let creation = [
                ("cwd", &self.cwd),
                ("initial_command", &self.initial_command),
                ("task_no", &self.task_no),
                ("name", &self.name),
            ];
            for (key, value) in creation {
                if let Some(value) = value {
                    params.push((key, value.as_str()));
                }
            }
        }
        Ok(reqwest::Url::parse_with_params(&format!("{base}/ws/terminal"), &params)?)
    }
}

/// What the client reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    Connected,
    Output(Bytes),
    Control(ControlFrame),
    /// The connection dropped; retry number `attempt` follows after the delay.
    Reconnecting { attempt: u32 },
    /// Retries are exhausted. The session itself may still be running.
    GaveUp,
}

/// What the owner sends through the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerInput {
    Data(Bytes),
    Control(ClientFrame),
}

/// A reconnecting viewer connection running on its own task.
pub struct ViewerClient {
    events: mpsc::Receiver<ViewerEvent>,
    input: mpsc::Sender<ViewerInput>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ViewerClient {
    pub fn connect(target: ViewerTarget, policy: ReconnectPolicy) -> Self {
        let (events_tx, events) = mpsc::channel(256);
        let (input, input_rx) = mpsc::channel(256);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(target, policy, events_tx, input_rx, shutdown.clone()));
        Self { events, input, shutdown, task }
    }

    /// Next event, or `None` once the client has stopped.
    pub async fn next_event(&mut self) -> Option<ViewerEvent> {
        self.events.recv().await
    }

    pub async fn send_input(&self, data: impl Into<Bytes>) -> anyhow::Result<()> {
        self.input
            .send(ViewerInput::Data(data.into()))
            .await
            .map_err(|_| anyhow::anyhow!("viewer client stopped"))
    }

    pub async fn send_control(&self, frame: ClientFrame) -> anyhow::Result<()> {
        self.input
            .send(ViewerInput::Control(frame))
            .await
            .map_err(|_| anyhow::anyhow!("viewer client stopped"))
    }

    /// Close the connection and wait for the task to finish.
    pub async fn close(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

enum Ended {
    /// Stop for good: shutdown, kill sent, fatal error frame, owner gone.
    Finished,
    /// Transport lost; try again.
    Dropped(String),
}

async fn run(
    target: ViewerTarget,
    policy: ReconnectPolicy,
    events: mpsc::Sender<ViewerEvent>,
    mut input: mpsc::Receiver<ViewerInput>,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut first = true;

    loop {
        let url = match target.url(first) {
            Ok(url) => url,
            Err(e) => {
                debug!(session_id = %target.session_id, err = %e, "invalid viewer url");
                let _ = events.send(ViewerEvent::GaveUp).await;
                return;
            }
        };

        let connected = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((ws, _response)) => {
                attempt = 0;
                first = false;
                if events.send(ViewerEvent::Connected).await.is_err() {
                    return;
                }
                match relay(ws, &events, &mut input, &shutdown).await {
                    Ended::Finished => return,
                    Ended::Dropped(reason) => {
                        debug!(session_id = %target.session_id, reason, "viewer connection lost");
                    }
                }
            }
            Err(e) => debug!(session_id = %target.session_id, err = %e, "viewer connect failed"),
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            let _ = events.send(ViewerEvent::GaveUp).await;
            return;
        }
        if events.send(ViewerEvent::Reconnecting { attempt }).await.is_err() {
            return;
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}

async fn relay<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    events: &mpsc::Sender<ViewerEvent>,
    input: &mut mpsc::Receiver<ViewerInput>,
    shutdown: &CancellationToken,
) -> Ended
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut killed = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ended::Finished;
            }
            msg = ws_rx.next() => {
                let event = match msg {
                    Some(Ok(Message::Binary(data))) => ViewerEvent::Output(data),
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ControlFrame>(text.as_str()) {
                        Ok(frame) => {
                            let fatal = matches!(frame, ControlFrame::Error { .. });
                            if events.send(ViewerEvent::Control(frame)).await.is_err() || fatal {
                                return Ended::Finished;
                            }
                            continue;
                        }
                        Err(_) => ViewerEvent::Output(Bytes::copy_from_slice(text.as_bytes())),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        if killed {
                            return Ended::Finished;
                        }
                        return Ended::Dropped("connection closed".to_owned());
                    }
                    Some(Err(e)) => return Ended::Dropped(e.to_string()),
                    Some(Ok(_)) => continue,
                };
                if events.send(event).await.is_err() {
                    return Ended::Finished;
                }
            }
            item = input.recv() => {
                let message = match item {
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ended::Finished;
                    }
                    Some(ViewerInput::Data(data)) => Message::Binary(data),
                    Some(ViewerInput::Control(frame)) => {
                        killed |= frame == ClientFrame::Kill;
                        match serde_json::to_string(&frame) {
                            Ok(text) => Message::Text(text.into()),
                            Err(_) => continue,
                        }
                    }
                };
                if let Err(e) = ws_tx.send(message).await {
                    return Ended::Dropped(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
