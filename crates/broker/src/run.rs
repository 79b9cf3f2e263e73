// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level broker runner — shared by `main` and integration tests.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::registry::{self, Subscribed};
use crate::session;
use crate::state::Store;

/// Run the broker to completion: bind, serve until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    let (store, feed_rx) = Store::new(&config);
    serve(listener, store, feed_rx, shutdown).await
}

/// Accept loop over an already-bound listener. Spawns the registry
/// displacement task and one session per connection; returns when the
/// shutdown token fires.
pub async fn serve(
    listener: TcpListener,
    store: Arc<Store>,
    feed_rx: mpsc::Receiver<Subscribed>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "smp broker listening");

    let registry_task =
        tokio::spawn(registry::run(Arc::clone(&store.registry), feed_rx, shutdown.clone()));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                debug!(%peer, "client connected");
                tokio::spawn(session::run(stream, Arc::clone(&store)));
            }
            _ = shutdown.cancelled() => break,
        }
    }

    registry_task.abort();
    info!("smp broker stopped");
    Ok(())
}

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / SMPD_LOG_LEVEL > RUST_LOG > default ("info").
    let filter = if std::env::var("SMPD_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}
