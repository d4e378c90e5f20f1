// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wtmux::config::Config;
use wtmux::health::spawn_health_checker;
use wtmux::transport::{build_router, AppState};

#[tokio::main]
async fn main() {
    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);

    if let Err(e) = run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format.as_str() {
        "json" => {
            fmt::fmt().with_env_filter(filter).json().init();
        }
        _ => {
            fmt::fmt().with_env_filter(filter).init();
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    if let Err(e) = tokio::fs::create_dir_all(&config.log_dir).await {
        warn!(dir = %config.log_dir.display(), err = %e, "cannot create log dir");
    }

    let state = Arc::new(AppState::from_config(&config, shutdown.clone())?);
    let checker = spawn_health_checker(
        state.reconciler.clone(),
        config.health_check_interval(),
        shutdown.clone(),
    );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    // Spawn signal handler
    {
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
            tokio::select! {
                _ = async {
                    if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            }
            sd.cancel();
        });
    }

    let result = axum::serve(listener, build_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
    shutdown.cancel();
    let _ = checker.await;
    state.registry.destroy_all();
    info!("shut down");

    result.map_err(Into::into)
}
