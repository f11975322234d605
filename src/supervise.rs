//! Process supervision: spawn, stream output, graceful-then-forceful stop.
#![allow(dead_code)]

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Default grace period between the termination and kill signals.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(2500);

/// What to launch and how.
#[derive(Clone, Debug)]
pub struct ServiceSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Non-critical services may crash without failing the session.
    pub critical: bool,
}

/// Terminal state of a supervised process.
#[derive(Clone, Copy, Debug)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

/// Runtime handle for one supervised child. Never persisted.
pub struct ProcessHandle {
    pub name: String,
    pub pid: Option<u32>,
    pub critical: bool,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    io_tasks: Vec<JoinHandle<()>>,
}

/// Launch a service with a merged environment (ambient plus the spec's
/// overrides) and line-forwarded output.
pub fn start(spec: ServiceSpec) -> Result<ProcessHandle> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    {
        // New session so the whole process tree can be signalled at once.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|e| Error::Spawn {
        service: spec.name.clone(),
        source: e,
    })?;
    let pid = child.id();
    tracing::info!("Started {} (pid {:?})", spec.name, pid);

    let mut io_tasks = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        io_tasks.push(forward_lines(spec.name.clone(), "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        io_tasks.push(forward_lines(spec.name.clone(), "stderr", stderr));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let name = spec.name.clone();
    tokio::spawn(async move {
        let info = match child.wait().await {
            Ok(status) => ExitInfo {
                code: status.code(),
                success: status.success(),
            },
            Err(e) => {
                tracing::warn!("wait for {} failed: {}", name, e);
                ExitInfo {
                    code: None,
                    success: false,
                }
            }
        };
        tracing::info!("{} exited (code {:?})", name, info.code);
        let _ = exit_tx.send(Some(info));
    });

    Ok(ProcessHandle {
        name: spec.name,
        pid,
        critical: spec.critical,
        exit_rx,
        io_tasks,
    })
}

impl ProcessHandle {
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Resolve once the process has exited.
    pub async fn wait_exit(&mut self) -> ExitInfo {
        loop {
            if let Some(info) = *self.exit_rx.borrow() {
                return info;
            }
            if self.exit_rx.changed().await.is_err() {
                return ExitInfo {
                    code: None,
                    success: false,
                };
            }
        }
    }

    /// Graceful-then-forceful shutdown.
    ///
    /// Sends the termination signal and waits up to `grace` for exit; if
    /// the process is still alive, kills it and waits up to `grace` again.
    /// Each wait resolves on exit or timeout, whichever comes first.
    pub async fn stop(&mut self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        let Some(pid) = self.pid else {
            return;
        };

        tracing::debug!("Stopping {} (pid {})", self.name, pid);
        send_signal(pid, Signal::Terminate);
        if timeout(grace, self.wait_exit()).await.is_ok() {
            return;
        }

        tracing::warn!("{} ignored termination, killing", self.name);
        send_signal(pid, Signal::Kill);
        let _ = timeout(grace, self.wait_exit()).await;
    }

    /// Watch-channel receiver resolving when the process exits, for
    /// callers that need to observe many children at once.
    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Cancel the output-forwarding subscriptions without touching the
    /// process itself.
    pub fn abort_io(&mut self) {
        for task in self.io_tasks.drain(..) {
            task.abort();
        }
    }
}

fn forward_lines<R>(service: String, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // `lines` yields the trailing partial line before EOF, so nothing
        // the child wrote is dropped.
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(service = %service, stream = stream, "{}", line);
        }
    })
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let signum = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative pid targets the process group created by setsid.
    unsafe {
        libc::kill(-(pid as i32), signum);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) {
    tracing::warn!("signal delivery is not supported on this platform");
}

/// Graceful-then-forceful stop for a process we only know by pid, e.g.
/// one recorded by a previous daemon incarnation.
pub async fn stop_pid(pid: u32, grace: Duration) {
    if !pid_alive(pid) {
        return;
    }
    send_signal(pid, Signal::Terminate);
    if wait_pid_gone(pid, grace).await {
        return;
    }
    send_signal(pid, Signal::Kill);
    wait_pid_gone(pid, grace).await;
}

async fn wait_pid_gone(pid: u32, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    !pid_alive(pid)
}

/// Signal-0 liveness probe.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
