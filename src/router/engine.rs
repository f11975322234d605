//! Shared engine process lifecycle and its HTTP client surface.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::health::{probe_http, wait_healthy, DEFAULT_POLL_INTERVAL};
use crate::router::state::ServiceRecord;
use crate::router::DaemonContext;
use crate::sidecar::{Resolver, ENGINE_SERVICE};
use crate::supervise::{self, pid_alive, ServiceSpec, DEFAULT_GRACE};

const ENGINE_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const ENGINE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Ask the OS for an unused loopback port.
pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Arguments for `opencode serve`, including the desktop CORS origins.
pub fn build_engine_args(bind_host: &str, port: u16) -> Vec<String> {
    vec![
        "serve".to_string(),
        "--hostname".to_string(),
        bind_host.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--cors".to_string(),
        "http://localhost:5173".to_string(),
        "--cors".to_string(),
        "tauri://localhost".to_string(),
        "--cors".to_string(),
        "http://tauri.localhost".to_string(),
    ]
}

/// Environment overrides every engine child receives.
pub fn engine_env(run_id: &str) -> Vec<(String, String)> {
    vec![
        ("OPENCODE_CLIENT".to_string(), "openwork".to_string()),
        ("OPENWORK".to_string(), "1".to_string()),
        ("OPENWORK_RUN_ID".to_string(), run_id.to_string()),
    ]
}

/// Return the base URL of a live shared engine, launching one if the
/// recorded process is dead or absent.
pub async fn ensure_engine(ctx: &DaemonContext) -> Result<String> {
    if let Some(record) = ctx.store.snapshot().await.engine {
        if pid_alive(record.pid) {
            return Ok(record.base_url);
        }
        tracing::info!("Recorded engine pid {} is dead, relaunching", record.pid);
    }
    launch_engine(ctx).await
}

async fn launch_engine(ctx: &DaemonContext) -> Result<String> {
    let mut guard = ctx.engine.lock().await;

    // Another request may have finished launching while we waited.
    if let Some(record) = ctx.store.snapshot().await.engine {
        if pid_alive(record.pid) {
            return Ok(record.base_url);
        }
    }

    let resolver = Resolver {
        config: &ctx.config,
        http: &ctx.http,
        manifests: &ctx.manifests,
    };
    let mut binary = resolver
        .resolve(ENGINE_SERVICE, ctx.config.engine_bin.as_deref())
        .await?;
    if binary.expected_version.is_some() {
        resolver.verify_version(ENGINE_SERVICE, &mut binary).await?;
    }

    let host = ctx.config.daemon_host.clone();
    let port = find_free_port()?;
    let base_url = format!("http://{}:{}", host, port);

    // The engine works from the active workspace when one is registered.
    let state = ctx.store.snapshot().await;
    let cwd = state
        .workspaces
        .iter()
        .find(|w| w.id == state.active_workspace_id)
        .and_then(|w| w.path.clone())
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| ctx.config.data_dir.clone());

    std::fs::create_dir_all(&cwd).ok();

    let mut handle = supervise::start(ServiceSpec {
        name: ENGINE_SERVICE.to_string(),
        program: binary.path.clone(),
        args: build_engine_args(&host, port),
        cwd: Some(cwd),
        env: engine_env(&ctx.run_id),
        critical: true,
    })?;

    let health_url = format!("{}/health", base_url);
    let health = wait_healthy(
        "opencode engine",
        ENGINE_HEALTH_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
        || probe_http(&ctx.http, &health_url, ENGINE_PROBE_TIMEOUT),
    )
    .await;
    if let Err(e) = health {
        handle.stop(DEFAULT_GRACE).await;
        return Err(e);
    }

    let pid = handle.pid.unwrap_or_default();
    *guard = Some(handle);

    ctx.store
        .mutate(|state| {
            state.engine = Some(ServiceRecord {
                pid,
                port,
                base_url: base_url.clone(),
                started_at: Utc::now(),
            });
            state.diagnostics.last_error = None;
        })
        .await?;

    tracing::info!("Engine healthy at {}", base_url);
    Ok(base_url)
}

/// Stop the shared engine: the handle we own if any, otherwise the
/// recorded pid from a previous incarnation.
pub async fn stop_engine(ctx: &DaemonContext) {
    if let Some(mut handle) = ctx.engine.lock().await.take() {
        handle.stop(DEFAULT_GRACE).await;
        return;
    }
    if let Some(record) = ctx.store.snapshot().await.engine {
        supervise::stop_pid(record.pid, DEFAULT_GRACE).await;
    }
}

#[derive(Deserialize)]
struct PathResponse {
    path: String,
}

#[derive(Deserialize)]
struct DisposeResponse {
    #[serde(default)]
    disposed: bool,
}

/// Ask an engine (or a remote workspace server) for the live filesystem
/// path of a directory it manages.
pub async fn query_path(
    http: &reqwest::Client,
    base_url: &str,
    directory: &str,
) -> Result<String> {
    let response = http
        .get(format!("{}/path", base_url.trim_end_matches('/')))
        .query(&[("directory", directory)])
        .timeout(ENGINE_PROBE_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    let body: PathResponse = response.json().await?;
    Ok(body.path)
}

/// Dispose the engine instance scoped to one directory.
pub async fn dispose_instance(
    http: &reqwest::Client,
    base_url: &str,
    directory: &str,
) -> Result<bool> {
    let response = http
        .post(format!("{}/instances/dispose", base_url.trim_end_matches('/')))
        .query(&[("directory", directory)])
        .timeout(ENGINE_PROBE_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    let body: DisposeResponse = response.json().await?;
    Ok(body.disposed)
}
