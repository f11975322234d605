//! CLI commands for openwork using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

use crate::config::{
    default_data_dir, Config, DEFAULT_ASSET_BASE_URL, DEFAULT_DAEMON_HOST, DEFAULT_MANIFEST_URL,
};
use crate::error::{Error, Result};
use crate::router::attach::attach_or_spawn;
use crate::router::state::read_state;
use crate::session::{self, SessionOptions};
use crate::sidecar::{ManifestCache, Resolver, SourcePreference, ENGINE_SERVICE};
use crate::supervise::pid_alive;

/// openwork - boots and supervises one workspace session.
#[derive(Parser)]
#[command(name = "openwork")]
#[command(version)]
#[command(about = "Workspace session orchestrator", long_about = None)]
pub struct Commands {
    #[command(flatten)]
    pub opts: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Clone, Debug)]
pub struct GlobalOpts {
    /// Data directory for state and logs
    #[arg(long, global = true, env = "OPENWORK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Cache directory for downloaded sidecars
    #[arg(long, global = true, env = "OPENWORK_SIDECAR_DIR")]
    pub sidecar_dir: Option<PathBuf>,

    /// Sidecar acquisition source
    #[arg(
        long = "sidecar-source",
        alias = "opencode-source",
        global = true,
        env = "OPENWORK_SIDECAR_SOURCE",
        value_enum,
        default_value = "auto"
    )]
    pub sidecar_source: SourcePreference,

    /// Release manifest URL for sidecar downloads
    #[arg(long, global = true, env = "OPENWORK_SIDECAR_MANIFEST")]
    pub sidecar_manifest: Option<String>,

    /// Base URL for sidecar release assets
    #[arg(long, global = true, env = "OPENWORK_SIDECAR_BASE_URL")]
    pub sidecar_base_url: Option<String>,

    /// Host the router daemon binds
    #[arg(long, global = true, env = "OPENWORK_DAEMON_HOST")]
    pub daemon_host: Option<String>,

    /// Port the router daemon binds (defaults to 8787, then ephemeral)
    #[arg(long, global = true, env = "OPENWORK_DAEMON_PORT")]
    pub daemon_port: Option<u16>,

    /// Allow externally supplied sidecar binaries
    #[arg(long, global = true, env = "OPENWORK_ALLOW_EXTERNAL")]
    pub allow_external: bool,

    /// Explicit engine binary (requires --allow-external)
    #[arg(long, global = true, env = "OPENWORK_ENGINE_BIN")]
    pub engine_bin: Option<PathBuf>,

    /// Explicit server binary (requires --allow-external)
    #[arg(long, global = true, env = "OPENWORK_SERVER_BIN")]
    pub server_bin: Option<PathBuf>,

    /// Explicit companion bot binary (requires --allow-external)
    #[arg(long, global = true, env = "OPENWORK_BOT_BIN")]
    pub bot_bin: Option<PathBuf>,

    /// Emit machine-readable JSON errors
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a foreground workspace session (engine, server, bot)
    Start {
        /// Workspace directory
        #[arg(long, default_value = ".")]
        workspace: PathBuf,

        /// Host the services bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Workspace server port
        #[arg(long)]
        port: Option<u16>,

        /// Skip the companion bot
        #[arg(long)]
        no_bot: bool,
    },

    /// Router daemon control
    #[command(subcommand)]
    Daemon(DaemonCommand),

    /// Workspace registry operations (talks to the daemon)
    #[command(subcommand, alias = "ws")]
    Workspace(WorkspaceCommand),

    /// Report daemon liveness and the resolved engine binary
    Status,
}

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Run the router daemon in the foreground
    Run,

    /// Ask a running daemon to shut down
    Stop,
}

#[derive(Subcommand)]
pub enum WorkspaceCommand {
    /// List registered workspaces
    List,

    /// Register (or refresh) a local workspace and activate it
    Add {
        path: String,

        #[arg(long)]
        name: Option<String>,
    },

    /// Register a remote workspace and activate it
    AddRemote {
        base_url: String,

        #[arg(long)]
        directory: Option<String>,

        #[arg(long)]
        name: Option<String>,
    },

    /// Show one workspace by id, name, or path
    Get { key: String },

    /// Activate a workspace
    Activate { key: String },

    /// Resolve a workspace's live filesystem path via the engine
    Path { key: String },

    /// Dispose the engine instance for a workspace
    Dispose { key: String },
}

impl Commands {
    /// Assemble the run configuration from flags and environment.
    pub fn config(&self) -> Result<Config> {
        let data_dir = match &self.opts.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir()?,
        };
        let sidecar_dir = self
            .opts
            .sidecar_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("sidecars"));

        Ok(Config {
            data_dir,
            sidecar_dir,
            sidecar_source: self.opts.sidecar_source,
            sidecar_manifest: self
                .opts
                .sidecar_manifest
                .clone()
                .unwrap_or_else(|| DEFAULT_MANIFEST_URL.to_string()),
            sidecar_base_url: self
                .opts
                .sidecar_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_ASSET_BASE_URL.to_string()),
            daemon_host: self
                .opts
                .daemon_host
                .clone()
                .unwrap_or_else(|| DEFAULT_DAEMON_HOST.to_string()),
            daemon_port: self.opts.daemon_port,
            allow_external: self.opts.allow_external,
            engine_bin: self.opts.engine_bin.clone(),
            server_bin: self.opts.server_bin.clone(),
            bot_bin: self.opts.bot_bin.clone(),
            json_output: self.opts.json,
        })
    }

    /// Run the command.
    pub async fn run(self, config: Config) -> Result<()> {
        match self.command {
            Command::Start {
                workspace,
                host,
                port,
                no_bot,
            } => {
                session::run_session(
                    &config,
                    SessionOptions {
                        workspace,
                        host,
                        port,
                        no_bot,
                    },
                )
                .await
            }
            Command::Daemon(DaemonCommand::Run) => crate::router::server::run_daemon(config).await,
            Command::Daemon(DaemonCommand::Stop) => daemon_stop(&config).await,
            Command::Workspace(cmd) => workspace_command(&config, cmd).await,
            Command::Status => status(&config).await,
        }
    }
}

async fn workspace_command(config: &Config, cmd: WorkspaceCommand) -> Result<()> {
    let http = reqwest::Client::new();
    let daemon = attach_or_spawn(config, &http).await?;
    let base = daemon.base_url;

    let value = match cmd {
        WorkspaceCommand::List => get_json(&http, &format!("{}/workspaces", base)).await?,
        WorkspaceCommand::Add { path, name } => {
            post_json(
                &http,
                &format!("{}/workspaces", base),
                json!({ "path": path, "name": name }),
            )
            .await?
        }
        WorkspaceCommand::AddRemote {
            base_url,
            directory,
            name,
        } => {
            post_json(
                &http,
                &format!("{}/workspaces/remote", base),
                json!({ "baseUrl": base_url, "directory": directory, "name": name }),
            )
            .await?
        }
        WorkspaceCommand::Get { key } => {
            get_json(&http, &format!("{}/workspaces/{}", base, key)).await?
        }
        WorkspaceCommand::Activate { key } => {
            post_json(
                &http,
                &format!("{}/workspaces/{}/activate", base, key),
                json!({}),
            )
            .await?
        }
        WorkspaceCommand::Path { key } => {
            get_json(&http, &format!("{}/workspaces/{}/path", base, key)).await?
        }
        WorkspaceCommand::Dispose { key } => {
            post_json(
                &http,
                &format!("{}/instances/{}/dispose", base, key),
                json!({}),
            )
            .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn daemon_stop(config: &Config) -> Result<()> {
    let record = read_state(&config.state_path()).daemon;
    let Some(record) = record else {
        println!("No daemon running");
        return Ok(());
    };
    if !pid_alive(record.pid) {
        println!("No daemon running (stale record for pid {})", record.pid);
        return Ok(());
    }

    let http = reqwest::Client::new();
    post_json(&http, &format!("{}/shutdown", record.base_url), json!({})).await?;
    println!("Daemon at {} shutting down", record.base_url);
    Ok(())
}

/// Doctor-style summary: daemon liveness plus the engine binary this
/// configuration would run.
async fn status(config: &Config) -> Result<()> {
    let state = read_state(&config.state_path());
    let daemon_alive = state
        .daemon
        .as_ref()
        .map(|rec| pid_alive(rec.pid))
        .unwrap_or(false);

    let http = reqwest::Client::new();
    let manifests = ManifestCache::new();
    let resolver = Resolver {
        config,
        http: &http,
        manifests: &manifests,
    };
    let engine = match resolver
        .resolve(ENGINE_SERVICE, config.engine_bin.as_deref())
        .await
    {
        Ok(mut binary) => {
            let version_error = resolver
                .verify_version(ENGINE_SERVICE, &mut binary)
                .await
                .err()
                .map(|e| e.to_string());
            json!({
                "path": binary.path.to_string_lossy(),
                "source": binary.source,
                "expectedVersion": binary.expected_version,
                "actualVersion": binary.actual_version,
                "versionError": version_error,
            })
        }
        Err(e) => json!({ "error": e.to_string() }),
    };

    let report = json!({
        "daemon": state.daemon,
        "daemonAlive": daemon_alive,
        "engine": engine,
        "activeId": state.active_workspace_id,
        "workspaceCount": state.workspaces.len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn get_json(http: &reqwest::Client, url: &str) -> Result<Value> {
    let response = http.get(url).send().await?;
    into_json(response).await
}

async fn post_json(http: &reqwest::Client, url: &str, body: Value) -> Result<Value> {
    let response = http.post(url).json(&body).send().await?;
    into_json(response).await
}

async fn into_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let value = response.json::<Value>().await.unwrap_or(Value::Null);
    if status.is_success() {
        Ok(value)
    } else {
        let message = value
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("request failed");
        Err(Error::Daemon(format!("{} ({})", message, status)))
    }
}
