//! Idempotent daemon bootstrap: probe an existing daemon, spawn a
//! detached one if absent, poll until it answers.

use std::process::Stdio;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{probe_http, wait_healthy};
use crate::router::state::read_state;
use crate::supervise::pid_alive;

/// How long an existing daemon gets to answer its health endpoint.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a freshly spawned daemon gets to come up.
const SPAWN_WAIT: Duration = Duration::from_secs(15);
const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// A live daemon the CLI can talk to.
#[derive(Clone, Debug)]
pub struct DaemonEndpoint {
    pub base_url: String,
    pub pid: u32,
}

/// Attach to the daemon recorded in the state file, spawning one when no
/// live daemon answers. "Is there a daemon" and "start a daemon" collapse
/// into this one idempotent operation.
pub async fn attach_or_spawn(config: &Config, http: &reqwest::Client) -> Result<DaemonEndpoint> {
    if let Some(endpoint) = probe_existing(config, http).await {
        tracing::debug!("Reusing daemon at {} (pid {})", endpoint.base_url, endpoint.pid);
        return Ok(endpoint);
    }

    tracing::info!("No live daemon, spawning one");
    spawn_detached(config)?;

    let state_path = config.state_path();
    let http = http.clone();
    wait_healthy(
        "router daemon",
        SPAWN_WAIT,
        SPAWN_POLL_INTERVAL,
        move || {
            let http = http.clone();
            let state_path = state_path.clone();
            async move {
                let state = read_state(&state_path);
                let Some(record) = state.daemon else {
                    return Err("daemon not registered yet".to_string());
                };
                if !pid_alive(record.pid) {
                    return Err(format!("daemon pid {} not alive", record.pid));
                }
                let url = format!("{}/health", record.base_url);
                probe_http(&http, &url, PROBE_TIMEOUT).await?;
                Ok(DaemonEndpoint {
                    base_url: record.base_url,
                    pid: record.pid,
                })
            }
        },
    )
    .await
}

/// Trust the persisted daemon record only when its pid is alive and the
/// health endpoint answers within the probe window.
async fn probe_existing(config: &Config, http: &reqwest::Client) -> Option<DaemonEndpoint> {
    let record = read_state(&config.state_path()).daemon?;
    if !pid_alive(record.pid) {
        tracing::debug!("Recorded daemon pid {} is dead", record.pid);
        return None;
    }
    let url = format!("{}/health", record.base_url);
    match probe_http(http, &url, PROBE_TIMEOUT).await {
        Ok(()) => Some(DaemonEndpoint {
            base_url: record.base_url,
            pid: record.pid,
        }),
        Err(e) => {
            tracing::debug!("Recorded daemon did not answer health probe: {}", e);
            None
        }
    }
}

/// Flags a re-exec'd daemon needs to behave like this invocation.
pub fn build_daemon_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "daemon".to_string(),
        "run".to_string(),
        "--data-dir".to_string(),
        config.data_dir.to_string_lossy().to_string(),
        "--sidecar-dir".to_string(),
        config.sidecar_dir.to_string_lossy().to_string(),
        "--sidecar-source".to_string(),
        config.sidecar_source.as_str().to_string(),
        "--sidecar-manifest".to_string(),
        config.sidecar_manifest.clone(),
        "--sidecar-base-url".to_string(),
        config.sidecar_base_url.clone(),
        "--daemon-host".to_string(),
        config.daemon_host.clone(),
    ];

    if let Some(port) = config.daemon_port {
        args.push("--daemon-port".to_string());
        args.push(port.to_string());
    }
    if config.allow_external {
        args.push("--allow-external".to_string());
    }
    if let Some(bin) = &config.engine_bin {
        args.push("--engine-bin".to_string());
        args.push(bin.to_string_lossy().to_string());
    }
    if let Some(bin) = &config.server_bin {
        args.push("--server-bin".to_string());
        args.push(bin.to_string_lossy().to_string());
    }
    if let Some(bin) = &config.bot_bin {
        args.push("--bot-bin".to_string());
        args.push(bin.to_string_lossy().to_string());
    }

    args
}

/// Launch a background copy of this executable running the daemon,
/// detached from the current terminal and session.
fn spawn_detached(config: &Config) -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.args(build_daemon_args(config))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = cmd.spawn().map_err(|e| Error::Spawn {
        service: "router daemon".to_string(),
        source: e,
    })?;
    tracing::debug!("Spawned detached daemon (pid {})", child.id());
    Ok(())
}
