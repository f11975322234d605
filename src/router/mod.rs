//! Workspace router daemon: persisted state behind a small HTTP API.

pub mod api;
pub mod attach;
pub mod engine;
pub mod lock;
pub mod server;
pub mod state;

use tokio::sync::{watch, Mutex};

use crate::config::Config;
use crate::sidecar::ManifestCache;
use crate::supervise::ProcessHandle;
use state::StateStore;

/// Shared state for one daemon process: configuration, the persisted
/// state repository, and the handle of the engine child we own.
pub struct DaemonContext {
    pub config: Config,
    pub store: StateStore,
    pub http: reqwest::Client,
    pub manifests: ManifestCache,
    pub engine: Mutex<Option<ProcessHandle>>,
    pub run_id: String,
    shutdown_tx: watch::Sender<bool>,
}

impl DaemonContext {
    pub fn new(config: Config) -> Self {
        let store = StateStore::load(config.state_path());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            http: reqwest::Client::new(),
            manifests: ManifestCache::new(),
            engine: Mutex::new(None),
            run_id: uuid::Uuid::new_v4().to_string(),
            shutdown_tx,
        }
    }

    /// Ask the serve loop to stop accepting connections and tear down.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}
