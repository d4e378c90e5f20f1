// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket integration tests using real connections against an in-process
//! axum server backed by scripted processes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use wtmux::client::{ReconnectPolicy, ViewerClient, ViewerEvent, ViewerTarget};
use wtmux::session::frame::{ClientFrame, ControlFrame};
use wtmux::session::ServerStatus;
use wtmux::test_support::{
    spawn_http_server, task, wait_for, AppStateBuilder, FakeSpawner, StaticTasks,
};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsTx = futures_util::stream::SplitSink<WsStream, WsMessage>;
type WsRx = futures_util::stream::SplitStream<WsStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn ws_connect(addr: &SocketAddr, path_and_query: &str) -> anyhow::Result<(WsTx, WsRx)> {
    let url = format!("ws://{addr}{path_and_query}");
    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| anyhow::anyhow!("ws connect: {e}"))?;
    Ok(stream.split())
}

/// Next data or text message, skipping pings.
async fn ws_recv(rx: &mut WsRx) -> anyhow::Result<WsMessage> {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, rx.next())
            .await
            .map_err(|_| anyhow::anyhow!("ws recv timeout"))?
            .ok_or_else(|| anyhow::anyhow!("ws stream closed"))?
            .map_err(|e| anyhow::anyhow!("ws recv: {e}"))?;
        if !matches!(msg, WsMessage::Ping(_) | WsMessage::Pong(_)) {
            return Ok(msg);
        }
    }
}

async fn ws_recv_json(rx: &mut WsRx) -> anyhow::Result<Value> {
    match ws_recv(rx).await? {
        WsMessage::Text(text) => Ok(serde_json::from_str(text.as_str())?),
        other => anyhow::bail!("expected Text message, got {other:?}"),
    }
}

async fn ws_recv_binary(rx: &mut WsRx) -> anyhow::Result<Bytes> {
    match ws_recv(rx).await? {
        WsMessage::Binary(data) => Ok(data),
        other => anyhow::bail!("expected Binary message, got {other:?}"),
    }
}

/// Expect the server to close the connection.
async fn ws_expect_close(rx: &mut WsRx) -> anyhow::Result<()> {
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, rx.next()).await {
            Err(_) => anyhow::bail!("connection still open"),
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(WsMessage::Close(_)))) => return Ok(()),
            Ok(Some(Ok(_))) => continue,
        }
    }
}

async fn next_event(client: &mut ViewerClient) -> anyhow::Result<Option<ViewerEvent>> {
    Ok(tokio::time::timeout(RECV_TIMEOUT, client.next_event()).await?)
}

async fn ws_send_json(tx: &mut WsTx, value: &Value) -> anyhow::Result<()> {
    tx.send(WsMessage::Text(value.to_string().into())).await?;
    Ok(())
}

#[tokio::test]
async fn first_connect_creates_session_and_runs_bootstrap_once() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    let state = AppStateBuilder::new().spawner(Arc::clone(&spawner)).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    let query = "/ws/terminal?sessionId=t1&cwd=/tmp&initialCommand=echo%20hi";
    let (mut tx, _rx) = ws_connect(&addr, query).await?;
    wait_for(RECV_TIMEOUT, || spawner.spawn_count() == 1).await?;
    let process = spawner.last().ok_or_else(|| anyhow::anyhow!("no process"))?;
    assert_eq!(process.written(), "echo hi\n");
    assert_eq!(process.spec().cwd, std::path::PathBuf::from("/tmp"));

    tx.send(WsMessage::Close(None)).await?;
    let session = state.registry.get("t1").ok_or_else(|| anyhow::anyhow!("no session"))?;
    wait_for(RECV_TIMEOUT, || session.viewer_count() == 0).await?;

    // Same key again: reattach, no new spawn, no second bootstrap.
    let (_tx, _rx) = ws_connect(&addr, query).await?;
    wait_for(RECV_TIMEOUT, || session.viewer_count() == 1).await?;
    assert_eq!(spawner.spawn_count(), 1);
    assert_eq!(process.written(), "echo hi\n");
    Ok(())
}

#[tokio::test]
async fn replay_goes_only_to_the_new_viewer() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    let state = AppStateBuilder::new().spawner(Arc::clone(&spawner)).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    let (_tx_a, mut rx_a) = ws_connect(&addr, "/ws/terminal/t1?cwd=/tmp").await?;
    let session = {
        wait_for(RECV_TIMEOUT, || state.registry.get("t1").is_some_and(|s| s.viewer_count() == 1))
            .await?;
        state.registry.get("t1").ok_or_else(|| anyhow::anyhow!("no session"))?
    };
    let process = spawner.last().ok_or_else(|| anyhow::anyhow!("no process"))?;

    process.emit(b"hello ");
    assert_eq!(ws_recv_binary(&mut rx_a).await?, Bytes::from_static(b"hello "));

    let (_tx_b, mut rx_b) = ws_connect(&addr, "/ws/terminal/t1").await?;
    assert_eq!(ws_recv_json(&mut rx_b).await?, json!({"type": "pty:replay"}));
    assert_eq!(ws_recv_binary(&mut rx_b).await?, Bytes::from_static(b"hello "));
    wait_for(RECV_TIMEOUT, || session.viewer_count() == 2).await?;

    process.emit(b"world");
    assert_eq!(ws_recv_binary(&mut rx_a).await?, Bytes::from_static(b"world"));
    assert_eq!(ws_recv_binary(&mut rx_b).await?, Bytes::from_static(b"world"));
    Ok(())
}

#[tokio::test]
async fn exit_frame_reaches_live_and_late_viewers() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    let state = AppStateBuilder::new().spawner(Arc::clone(&spawner)).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    let (_tx, mut rx) = ws_connect(&addr, "/ws/terminal?session_id=t1&cwd=/tmp").await?;
    wait_for(RECV_TIMEOUT, || state.registry.get("t1").is_some_and(|s| s.viewer_count() == 1))
        .await?;
    let process = spawner.last().ok_or_else(|| anyhow::anyhow!("no process"))?;
    process.emit(b"bye\r\n");
    process.exit(3);

    assert_eq!(ws_recv_binary(&mut rx).await?, Bytes::from_static(b"bye\r\n"));
    assert_eq!(ws_recv_json(&mut rx).await?, json!({"type": "pty:exit", "code": 3}));

    let (_tx2, mut rx2) = ws_connect(&addr, "/ws/terminal?session_id=t1").await?;
    assert_eq!(ws_recv_json(&mut rx2).await?, json!({"type": "pty:replay"}));
    assert_eq!(ws_recv_binary(&mut rx2).await?, Bytes::from_static(b"bye\r\n"));
    assert_eq!(ws_recv_json(&mut rx2).await?, json!({"type": "pty:exit", "code": 3}));
    Ok(())
}

#[tokio::test]
async fn control_frames_and_raw_input() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    let state = AppStateBuilder::new().spawner(Arc::clone(&spawner)).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    let (mut tx, _rx) = ws_connect(&addr, "/ws/terminal?session_id=t1&cwd=/tmp").await?;
    wait_for(RECV_TIMEOUT, || spawner.spawn_count() == 1).await?;
    let process = spawner.last().ok_or_else(|| anyhow::anyhow!("no process"))?;

    ws_send_json(&mut tx, &json!({"type": "resize", "cols": 100, "rows": 40})).await?;
    ws_send_json(&mut tx, &json!({"type": "resize", "cols": 0, "rows": 10})).await?;
    // JSON that is not a control frame is typed input.
    tx.send(WsMessage::Text(r#"{"hello":1}"#.into())).await?;
    tx.send(WsMessage::Text("{not json".into())).await?;
    tx.send(WsMessage::Binary(Bytes::from_static(b"ls\r"))).await?;

    wait_for(RECV_TIMEOUT, || process.written().ends_with("ls\r")).await?;
    assert_eq!(process.written(), "{\"hello\":1}{not jsonls\r");
    assert_eq!(process.resizes(), vec![(100, 40)]);
    Ok(())
}

#[tokio::test]
async fn clear_frame_empties_scrollback() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    let state = AppStateBuilder::new().spawner(Arc::clone(&spawner)).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    let (mut tx, mut rx) = ws_connect(&addr, "/ws/terminal?session_id=t1&cwd=/tmp").await?;
    wait_for(RECV_TIMEOUT, || state.registry.get("t1").is_some_and(|s| s.viewer_count() == 1))
        .await?;
    let session = state.registry.get("t1").ok_or_else(|| anyhow::anyhow!("no session"))?;
    let process = spawner.last().ok_or_else(|| anyhow::anyhow!("no process"))?;
    process.emit(b"noise");
    ws_recv_binary(&mut rx).await?;

    ws_send_json(&mut tx, &json!({"type": "clear"})).await?;
    wait_for(RECV_TIMEOUT, || session.scrollback().is_empty()).await?;
    Ok(())
}

#[tokio::test]
async fn kill_destroys_terminal_but_not_server() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let spawner = FakeSpawner::new();
    let tasks = StaticTasks::new(vec![task("7", dir.path(), Some(4000))]);
    let state = AppStateBuilder::new().spawner(Arc::clone(&spawner)).tasks(tasks).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    state.manager.start_server("7").await?;
    let server_process = spawner.last().ok_or_else(|| anyhow::anyhow!("no process"))?;
    let (mut tx, _rx) = ws_connect(&addr, "/ws/terminal/server-7").await?;
    let server_session =
        state.registry.server_session("7").ok_or_else(|| anyhow::anyhow!("no server session"))?;
    wait_for(RECV_TIMEOUT, || server_session.viewer_count() == 1).await?;

    ws_send_json(&mut tx, &json!({"type": "kill"})).await?;
    tx.send(WsMessage::Binary(Bytes::from_static(b"\x03"))).await?;
    wait_for(RECV_TIMEOUT, || server_process.written().ends_with('\x03')).await?;
    assert_eq!(server_process.kill_count(), 0);
    assert_eq!(state.registry.derive_status("7"), ServerStatus::Starting);

    let (mut tx, mut rx) = ws_connect(&addr, "/ws/terminal?session_id=t2&cwd=/tmp").await?;
    wait_for(RECV_TIMEOUT, || state.registry.get("t2").is_some_and(|s| s.viewer_count() == 1))
        .await?;
    let terminal_process = spawner.last().ok_or_else(|| anyhow::anyhow!("no process"))?;
    ws_send_json(&mut tx, &json!({"type": "kill"})).await?;

    assert_eq!(ws_recv_json(&mut rx).await?, json!({"type": "pty:exit", "code": 129}));
    ws_expect_close(&mut rx).await?;
    assert!(state.registry.get("t2").is_none());
    assert_eq!(terminal_process.kill_count(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_session_is_reported_and_closed() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    let state = AppStateBuilder::new().spawner(Arc::clone(&spawner)).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    // No creation metadata.
    let (_tx, mut rx) = ws_connect(&addr, "/ws/terminal?session_id=ghost").await?;
    let frame = ws_recv_json(&mut rx).await?;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "SESSION_NOT_FOUND");
    ws_expect_close(&mut rx).await?;

    // Server ids are never created from a viewer.
    let (_tx, mut rx) = ws_connect(&addr, "/ws/terminal/server-7?cwd=/tmp").await?;
    let frame = ws_recv_json(&mut rx).await?;
    assert_eq!(frame["code"], "SESSION_NOT_FOUND");
    ws_expect_close(&mut rx).await?;

    assert_eq!(spawner.spawn_count(), 0);
    assert!(state.registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn spawn_failure_is_shown_inline() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    spawner.fail_with("exec /bin/nope: not found");
    let state = AppStateBuilder::new().spawner(Arc::clone(&spawner)).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    let (_tx, mut rx) = ws_connect(&addr, "/ws/terminal?session_id=t1&cwd=/tmp").await?;
    let frame = ws_recv_json(&mut rx).await?;
    assert_eq!(frame["code"], "SPAWN_FAILED");
    assert!(frame["message"].as_str().is_some_and(|m| m.contains("not found")), "{frame}");
    ws_expect_close(&mut rx).await?;
    assert!(state.registry.get("t1").is_none());
    Ok(())
}

#[tokio::test]
async fn log_stream_follows_file_and_clears() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let state = AppStateBuilder::new().log_dir(dir.path()).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;
    let log = dir.path().join("7.log");

    let (mut tx, mut rx) = ws_connect(&addr, "/ws/logs?task_no=7").await?;
    assert_eq!(ws_recv_json(&mut rx).await?, json!({"type": "log:no-file"}));

    std::fs::write(&log, "compiled\n")?;
    assert_eq!(ws_recv_binary(&mut rx).await?, Bytes::from_static(b"compiled\n"));

    ws_send_json(&mut tx, &json!({"type": "clear"})).await?;
    assert_eq!(ws_recv_json(&mut rx).await?, json!({"type": "log:clear"}));
    assert_eq!(std::fs::metadata(&log)?.len(), 0);
    Ok(())
}

#[tokio::test]
async fn log_stream_requires_valid_task() -> anyhow::Result<()> {
    let state = AppStateBuilder::new().build();
    let (addr, _server) = spawn_http_server(state).await?;

    assert!(ws_connect(&addr, "/ws/logs").await.is_err());
    assert!(ws_connect(&addr, "/ws/logs?task_no=..").await.is_err());
    Ok(())
}

#[tokio::test]
async fn viewer_client_sees_bootstrap_echo_and_kills() -> anyhow::Result<()> {
    let spawner = FakeSpawner::echoing();
    let state = AppStateBuilder::new().spawner(Arc::clone(&spawner)).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    let mut target = ViewerTarget::new(format!("ws://{addr}"), "t1");
    target.cwd = Some("/tmp".to_owned());
    target.initial_command = Some("make dev".to_owned());
    let mut client = ViewerClient::connect(target, ReconnectPolicy::default());

    assert_eq!(next_event(&mut client).await?, Some(ViewerEvent::Connected));
    // Created and attached in one step, so the echo arrives live.
    assert_eq!(
        next_event(&mut client).await?,
        Some(ViewerEvent::Output(Bytes::from_static(b"make dev\n")))
    );

    client.send_input(Bytes::from_static(b"q")).await?;
    assert_eq!(next_event(&mut client).await?, Some(ViewerEvent::Output(Bytes::from_static(b"q"))));

    client.send_control(ClientFrame::Kill).await?;
    assert_eq!(
        next_event(&mut client).await?,
        Some(ViewerEvent::Control(ControlFrame::Exit { code: 129 }))
    );
    assert_eq!(next_event(&mut client).await?, None);
    assert!(state.registry.get("t1").is_none());
    Ok(())
}

#[tokio::test]
async fn viewer_client_does_not_recreate_a_destroyed_session() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    let state = AppStateBuilder::new().spawner(Arc::clone(&spawner)).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    let mut target = ViewerTarget::new(format!("ws://{addr}"), "t1");
    target.cwd = Some("/tmp".to_owned());
    let policy = ReconnectPolicy { max_attempts: 3, delay: Duration::from_millis(20) };
    let mut client = ViewerClient::connect(target, policy);
    assert_eq!(next_event(&mut client).await?, Some(ViewerEvent::Connected));

    let process = spawner.last().ok_or_else(|| anyhow::anyhow!("no process"))?;
    process.exit(0);
    assert_eq!(
        next_event(&mut client).await?,
        Some(ViewerEvent::Control(ControlFrame::Exit { code: 0 }))
    );
    assert!(state.registry.destroy("t1"));

    // The reattach finds nothing and the client stops instead of spawning.
    let mut events = Vec::new();
    while let Some(event) = next_event(&mut client).await? {
        events.push(event);
    }
    assert!(
        events.iter().any(|e| matches!(
            e,
            ViewerEvent::Control(ControlFrame::Error { code, .. }) if code == "SESSION_NOT_FOUND"
        )),
        "{events:?}"
    );
    assert!(!events.contains(&ViewerEvent::GaveUp), "{events:?}");
    assert_eq!(spawner.spawn_count(), 1);
    assert!(state.registry.get("t1").is_none());
    Ok(())
}
