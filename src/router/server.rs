//! Router daemon startup, serve loop, and teardown.

use std::sync::Arc;

use chrono::Utc;
use tokio::net::TcpListener;

use crate::config::{Config, DEFAULT_DAEMON_PORT};
use crate::error::{Error, Result};
use crate::router::state::ServiceRecord;
use crate::router::{api, engine, DaemonContext};
use crate::supervise::pid_alive;

/// Run the workspace router daemon in the foreground until shutdown.
pub async fn run_daemon(config: Config) -> Result<()> {
    let ctx = Arc::new(DaemonContext::new(config));

    let previous_port = ctx.store.snapshot().await.daemon.map(|rec| rec.port);
    let listener = bind_listener(
        &ctx.config.daemon_host,
        ctx.config.daemon_port,
        previous_port,
    )
    .await?;
    let port = listener.local_addr()?.port();
    let base_url = format!("http://{}:{}", ctx.config.daemon_host, port);

    // Register ourselves before the engine launch so attach pollers can
    // find the daemon while the engine is still warming up.
    ctx.store
        .mutate(|state| {
            state.daemon = Some(ServiceRecord {
                pid: std::process::id(),
                port,
                base_url: base_url.clone(),
                started_at: Utc::now(),
            });
        })
        .await?;

    if let Err(e) = engine::ensure_engine(&ctx).await {
        // The daemon stays useful for workspace CRUD; the engine is
        // retried lazily by the next request that needs it.
        tracing::warn!("Engine launch failed at startup: {}", e);
        let message = e.to_string();
        ctx.store
            .mutate(|state| state.diagnostics.last_error = Some(message.clone()))
            .await?;
    }

    let app = api::build_router(ctx.clone());
    tracing::info!("Router daemon listening on {}", base_url);

    let mut shutdown_rx = ctx.shutdown_receiver();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_rx.changed() => {},
                _ = tokio::signal::ctrl_c() => {},
            }
        })
        .await?;

    teardown(&ctx).await
}

/// Bind the daemon listener: requested port, then the previously used
/// port, then the preferred default, then an ephemeral port.
async fn bind_listener(
    host: &str,
    requested: Option<u16>,
    previous: Option<u16>,
) -> Result<TcpListener> {
    if let Some(port) = requested {
        return TcpListener::bind((host, port)).await.map_err(|e| {
            Error::Daemon(format!("cannot bind requested port {}: {}", port, e))
        });
    }

    let mut candidates: Vec<u16> = Vec::new();
    if let Some(port) = previous {
        candidates.push(port);
    }
    candidates.push(DEFAULT_DAEMON_PORT);
    candidates.dedup();

    for port in candidates {
        if let Ok(listener) = TcpListener::bind((host, port)).await {
            return Ok(listener);
        }
        tracing::debug!("Port {} unavailable, trying next candidate", port);
    }

    TcpListener::bind((host, 0))
        .await
        .map_err(|e| Error::Daemon(format!("cannot bind an ephemeral port: {}", e)))
}

async fn teardown(ctx: &Arc<DaemonContext>) -> Result<()> {
    tracing::info!("Router daemon shutting down");
    engine::stop_engine(ctx).await;

    ctx.store
        .mutate(|state| {
            state.daemon = None;
            // Keep the engine record unless the process is confirmed dead,
            // so a successor daemon can still find and stop it.
            if let Some(record) = &state.engine {
                if !pid_alive(record.pid) {
                    state.engine = None;
                }
            }
        })
        .await?;

    tracing::info!("Router daemon terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_listener_prefers_the_previous_port() {
        let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let free_port = probe.local_addr().unwrap().port();
        drop(probe);

        let listener = bind_listener("127.0.0.1", None, Some(free_port))
            .await
            .unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), free_port);
    }

    #[tokio::test]
    async fn bind_listener_falls_back_to_an_ephemeral_port() {
        // Occupy a port, then ask for it as the previous port.
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let listener = bind_listener("127.0.0.1", None, Some(taken_port))
            .await
            .unwrap();
        let bound = listener.local_addr().unwrap().port();
        assert_ne!(bound, taken_port);
    }

    #[tokio::test]
    async fn bind_listener_fails_when_the_requested_port_is_taken() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let err = bind_listener("127.0.0.1", Some(taken_port), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requested port"));
    }
}
