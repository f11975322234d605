//! Direct foreground session: engine, server, and companion bot
//! supervised by the CLI without the router daemon.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{probe_http, wait_healthy, DEFAULT_POLL_INTERVAL};
use crate::router::engine::{build_engine_args, engine_env, find_free_port};
use crate::router::state::normalize_local_path;
use crate::sidecar::{
    ManifestCache, Resolver, SidecarBinary, BOT_SERVICE, ENGINE_SERVICE, SERVER_SERVICE,
};
use crate::supervise::{self, ExitInfo, ProcessHandle, ServiceSpec, DEFAULT_GRACE};

/// Preferred port for the workspace server, shared with remote clients.
const DEFAULT_SERVER_PORT: u16 = 8787;

const SESSION_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub workspace: PathBuf,
    pub host: String,
    pub port: Option<u16>,
    pub no_bot: bool,
}

/// Arguments for `openwork-server`.
pub fn build_server_args(
    host: &str,
    port: u16,
    workspace_path: &str,
    token: &str,
    host_token: &str,
    engine_base_url: Option<&str>,
    engine_directory: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--token".to_string(),
        token.to_string(),
        "--host-token".to_string(),
        host_token.to_string(),
        "--workspace".to_string(),
        workspace_path.to_string(),
        "--cors".to_string(),
        "http://localhost:5173".to_string(),
        "--cors".to_string(),
        "tauri://localhost".to_string(),
        "--cors".to_string(),
        "http://tauri.localhost".to_string(),
    ];

    if let Some(base_url) = engine_base_url {
        if !base_url.trim().is_empty() {
            args.push("--opencode-base-url".to_string());
            args.push(base_url.to_string());
        }
    }
    if let Some(directory) = engine_directory {
        if !directory.trim().is_empty() {
            args.push("--opencode-directory".to_string());
            args.push(directory.to_string());
        }
    }

    args
}

/// Arguments for `owpenbot start`.
pub fn build_bot_args(workspace_path: &str, engine_url: Option<&str>) -> Vec<String> {
    let mut args = vec!["start".to_string(), workspace_path.to_string()];
    if let Some(url) = engine_url {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            args.push("--opencode-url".to_string());
            args.push(trimmed.to_string());
        }
    }
    args
}

fn resolve_server_port(requested: Option<u16>) -> Result<u16> {
    if let Some(port) = requested {
        return Ok(port);
    }
    if std::net::TcpListener::bind(("0.0.0.0", DEFAULT_SERVER_PORT)).is_ok() {
        return Ok(DEFAULT_SERVER_PORT);
    }
    find_free_port()
}

fn session_env(run_id: &str) -> Vec<(String, String)> {
    vec![
        ("OPENWORK".to_string(), "1".to_string()),
        ("OPENWORK_RUN_ID".to_string(), run_id.to_string()),
    ]
}

/// Run one foreground workspace session until interrupt or crash.
pub async fn run_session(config: &Config, options: SessionOptions) -> Result<()> {
    let workspace = normalize_local_path(&options.workspace.to_string_lossy());
    if !std::path::Path::new(&workspace).is_dir() {
        return Err(Error::Config(format!(
            "workspace directory does not exist: {}",
            workspace
        )));
    }

    let http = reqwest::Client::new();
    let manifests = ManifestCache::new();
    let resolver = Resolver {
        config,
        http: &http,
        manifests: &manifests,
    };

    let engine_binary =
        resolve_verified(&resolver, ENGINE_SERVICE, config.engine_bin.as_deref()).await?;
    let server_binary =
        resolve_verified(&resolver, SERVER_SERVICE, config.server_bin.as_deref()).await?;
    let bot_binary = if options.no_bot {
        None
    } else {
        // The bot is optional: resolution failure downgrades to a warning.
        match resolve_verified(&resolver, BOT_SERVICE, config.bot_bin.as_deref()).await {
            Ok(binary) => Some(binary),
            Err(e) => {
                tracing::warn!("Companion bot unavailable: {}", e);
                None
            }
        }
    };

    let run_id = uuid::Uuid::new_v4().to_string();
    let mut children: Vec<ProcessHandle> = Vec::new();

    // Engine first; everything else points at it.
    let engine_port = find_free_port()?;
    let engine_base = format!("http://{}:{}", options.host, engine_port);
    let engine = supervise::start(ServiceSpec {
        name: ENGINE_SERVICE.to_string(),
        program: engine_binary.path.clone(),
        args: build_engine_args(&options.host, engine_port),
        cwd: Some(PathBuf::from(&workspace)),
        env: engine_env(&run_id),
        critical: true,
    });
    children.push(match engine {
        Ok(handle) => handle,
        Err(e) => return Err(e),
    });
    if let Err(e) = wait_service_healthy(&http, ENGINE_SERVICE, &engine_base).await {
        stop_all(&mut children).await;
        return Err(e);
    }

    let server_port = resolve_server_port(options.port)?;
    let server_base = format!("http://{}:{}", options.host, server_port);
    let client_token = uuid::Uuid::new_v4().to_string();
    let host_token = uuid::Uuid::new_v4().to_string();
    let server = supervise::start(ServiceSpec {
        name: SERVER_SERVICE.to_string(),
        program: server_binary.path.clone(),
        args: build_server_args(
            &options.host,
            server_port,
            &workspace,
            &client_token,
            &host_token,
            Some(&engine_base),
            None,
        ),
        cwd: Some(PathBuf::from(&workspace)),
        env: session_env(&run_id),
        critical: true,
    });
    match server {
        Ok(handle) => children.push(handle),
        Err(e) => {
            stop_all(&mut children).await;
            return Err(e);
        }
    }
    if let Err(e) = wait_service_healthy(&http, SERVER_SERVICE, &server_base).await {
        stop_all(&mut children).await;
        return Err(e);
    }

    if let Some(binary) = bot_binary {
        let bot = supervise::start(ServiceSpec {
            name: BOT_SERVICE.to_string(),
            program: binary.path.clone(),
            args: build_bot_args(&workspace, Some(&engine_base)),
            cwd: Some(PathBuf::from(&workspace)),
            env: session_env(&run_id),
            critical: false,
        });
        match bot {
            Ok(handle) => children.push(handle),
            Err(e) => tracing::warn!("Companion bot failed to start: {}", e),
        }
    }

    println!("Workspace session ready");
    println!("  engine:  {}", engine_base);
    println!("  server:  {}/?token={}", server_base, client_token);

    let result = supervise_until_exit(&mut children).await;
    stop_all(&mut children).await;
    result
}

async fn resolve_verified(
    resolver: &Resolver<'_>,
    service: &str,
    explicit: Option<&std::path::Path>,
) -> Result<SidecarBinary> {
    let mut binary = resolver.resolve(service, explicit).await?;
    if binary.expected_version.is_some() {
        resolver.verify_version(service, &mut binary).await?;
    }
    Ok(binary)
}

async fn wait_service_healthy(http: &reqwest::Client, service: &str, base_url: &str) -> Result<()> {
    let url = format!("{}/health", base_url);
    wait_healthy(service, SESSION_HEALTH_TIMEOUT, DEFAULT_POLL_INTERVAL, || {
        probe_http(http, &url, PROBE_TIMEOUT)
    })
    .await
}

/// Block until interrupt or a child exit; a critical crash fails the run,
/// non-critical exits are logged and tolerated.
async fn supervise_until_exit(children: &mut [ProcessHandle]) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<(usize, ExitInfo)>(8);
    for (index, child) in children.iter().enumerate() {
        let mut exit_rx = child.exit_receiver();
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                let info = *exit_rx.borrow();
                if let Some(info) = info {
                    let _ = tx.send((index, info)).await;
                    return;
                }
                if exit_rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }
    drop(tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received, stopping session");
                return Ok(());
            }
            exited = rx.recv() => {
                let Some((index, info)) = exited else {
                    return Ok(());
                };
                let name = children[index].name.clone();
                if children[index].critical {
                    return Err(Error::Daemon(format!(
                        "{} exited unexpectedly (code {:?})",
                        name, info.code
                    )));
                }
                tracing::warn!(
                    "{} exited (code {:?}); session continues without it",
                    name,
                    info.code
                );
            }
        }
    }
}

async fn stop_all(children: &mut Vec<ProcessHandle>) {
    // Reverse of start order: bot, server, engine.
    while let Some(mut child) = children.pop() {
        child.stop(DEFAULT_GRACE).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_args_include_tokens_workspace_and_engine_url() {
        let args = build_server_args(
            "127.0.0.1",
            8787,
            "/work/demo",
            "client-token",
            "host-token",
            Some("http://127.0.0.1:4111"),
            None,
        );
        assert!(args.windows(2).any(|w| w == ["--token", "client-token"]));
        assert!(args.windows(2).any(|w| w == ["--host-token", "host-token"]));
        assert!(args.windows(2).any(|w| w == ["--workspace", "/work/demo"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--opencode-base-url", "http://127.0.0.1:4111"]));
        assert!(!args.contains(&"--opencode-directory".to_string()));
    }

    #[test]
    fn bot_args_start_with_the_workspace() {
        let args = build_bot_args("/work/demo", Some("http://127.0.0.1:4111"));
        assert_eq!(&args[..2], ["start", "/work/demo"]);
        assert!(args
            .windows(2)
            .any(|w| w == ["--opencode-url", "http://127.0.0.1:4111"]));

        let bare = build_bot_args("/work/demo", None);
        assert_eq!(bare.len(), 2);
    }

    #[test]
    fn server_port_prefers_the_requested_value() {
        assert_eq!(resolve_server_port(Some(9001)).unwrap(), 9001);
    }
}
