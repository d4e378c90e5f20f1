// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `wtmux` binary and drive it
//! over HTTP and WebSocket with real shells.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message;

use wtmux::worktree::TaskRecord;
use wtmux_specs::{free_port, WtmuxProcess};

const TIMEOUT: Duration = Duration::from_secs(10);

fn task_record(task_no: &str, path: &std::path::Path, port: u16, command: &str) -> TaskRecord {
    TaskRecord {
        task_no: task_no.to_owned(),
        path: path.to_path_buf(),
        port: Some(port),
        health_check_path: None,
        command: Some(command.to_owned()),
    }
}

/// Read binary frames until their concatenation contains `needle`.
async fn read_until<S>(rx: &mut S, needle: &str) -> anyhow::Result<String>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    let mut seen = String::new();
    while !seen.contains(needle) {
        let msg = tokio::time::timeout_at(deadline, rx.next())
            .await
            .map_err(|_| anyhow::anyhow!("never saw {needle:?}; got {seen:?}"))?
            .ok_or_else(|| anyhow::anyhow!("stream closed; got {seen:?}"))??;
        if let Message::Binary(data) = msg {
            seen.push_str(&String::from_utf8_lossy(&data));
        }
    }
    Ok(seen)
}

async fn get_json(url: &str) -> anyhow::Result<Value> {
    Ok(reqwest::get(url).await?.json().await?)
}

async fn post_json(url: &str) -> anyhow::Result<(u16, Value)> {
    let resp = reqwest::Client::new().post(url).send().await?;
    let status = resp.status().as_u16();
    Ok((status, resp.json().await?))
}

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let wtmux = WtmuxProcess::start()?;
    wtmux.wait_healthy(TIMEOUT).await?;

    let resp = get_json(&format!("{}/api/v1/health", wtmux.base_url())).await?;
    assert_eq!(resp["status"], "running");
    assert_eq!(resp["sessions"], 0);
    Ok(())
}

#[tokio::test]
async fn terminal_runs_bootstrap_in_real_shell() -> anyhow::Result<()> {
    let wtmux = WtmuxProcess::start()?;
    wtmux.wait_healthy(TIMEOUT).await?;
    let cwd = wtmux.scratch().to_string_lossy().into_owned();

    let url = reqwest::Url::parse_with_params(
        &format!("{}/ws/terminal", wtmux.ws_base()),
        &[("session_id", "s1"), ("cwd", cwd.as_str()), ("initial_command", "echo spec-$((6*7))")],
    )?;
    let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (_tx, mut rx) = stream.split();
    read_until(&mut rx, "spec-42").await?;

    let sessions = get_json(&format!("{}/api/v1/sessions", wtmux.base_url())).await?;
    assert_eq!(sessions[0]["id"], "s1");
    assert_eq!(sessions[0]["alive"], true);
    assert_eq!(sessions[0]["viewers"], 1);
    Ok(())
}

#[tokio::test]
async fn server_lifecycle_with_readiness_and_logs() -> anyhow::Result<()> {
    let worktree = tempfile::tempdir()?;
    std::fs::create_dir(worktree.path().join("node_modules"))?;
    let app_port = free_port()?;
    let wtmux = WtmuxProcess::build()
        .task(task_record("7", worktree.path(), app_port, "echo booted; sleep 30"))
        .spawn()?;
    wtmux.wait_healthy(TIMEOUT).await?;
    let base = wtmux.base_url();

    let (status, body) = post_json(&format!("{base}/api/v1/tasks/7/start")).await?;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["outcome"], "started");

    let (status, body) = post_json(&format!("{base}/api/v1/tasks/7/start")).await?;
    assert_eq!(status, 409, "{body}");

    // Nothing listens yet: still starting.
    let (_, body) = post_json(&format!("{base}/api/v1/health-check")).await?;
    assert_eq!(body["tasks"][0]["status"], "starting");

    // A listener that answers 404 still counts as up.
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", app_port)).await?;
    let responder = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let _ = socket
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        }
    });
    let (_, body) = post_json(&format!("{base}/api/v1/health-check")).await?;
    assert_eq!(body["tasks"][0]["status"], "running", "{body}");
    responder.abort();
    let _ = responder.await;

    // Server output is mirrored to the task log and streamed.
    let (stream, _) =
        tokio_tungstenite::connect_async(format!("{}/ws/logs?task_no=7", wtmux.ws_base())).await?;
    let (_tx, mut rx) = stream.split();
    read_until(&mut rx, "booted").await?;

    let (status, body) = post_json(&format!("{base}/api/v1/tasks/7/stop")).await?;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["destroyed_session"], true);

    let body = get_json(&format!("{base}/api/v1/tasks/7/status")).await?;
    assert_eq!(body["status"], "stopped");
    Ok(())
}
