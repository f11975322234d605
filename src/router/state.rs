//! Persisted router state: workspaces, daemon and engine records.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::router::lock::acquire_lock_waiting;

pub const STATE_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    Local,
    Remote,
}

/// One user project context, local directory or remote pointer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub kind: WorkspaceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// A liveness-checkable record of a long-running process we started.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub pid: u32,
    pub port: u16,
    pub base_url: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The daemon's persisted aggregate, one JSON document per data directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub daemon: Option<ServiceRecord>,
    #[serde(default)]
    pub engine: Option<ServiceRecord>,
    #[serde(default)]
    pub active_workspace_id: String,
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

impl Default for RouterState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            daemon: None,
            engine: None,
            active_workspace_id: String::new(),
            workspaces: Vec::new(),
            diagnostics: Diagnostics::default(),
        }
    }
}

/// Normalize a local workspace path: absolute, canonical where the path
/// exists, no trailing separator.
pub fn normalize_local_path(path: &str) -> String {
    let joined = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };

    let resolved = std::fs::canonicalize(&joined).unwrap_or(joined);
    let text = resolved.to_string_lossy();
    if text.len() > 1 {
        text.trim_end_matches('/').to_string()
    } else {
        text.to_string()
    }
}

pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("ws-{}", &hex[..12])
}

/// Deterministic workspace id for a canonical local path. Re-registering
/// the same path yields the same id.
pub fn local_workspace_id(normalized_path: &str) -> String {
    short_hash(normalized_path)
}

/// Deterministic workspace id for a remote server + directory pair.
pub fn remote_workspace_id(base_url: &str, directory: &str) -> String {
    short_hash(&format!("{}::{}", base_url, directory))
}

fn infer_local_name(normalized_path: &str) -> String {
    Path::new(normalized_path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("workspace")
        .to_string()
}

fn infer_remote_name(base_url: &str) -> String {
    let trimmed = base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = trimmed.split(['/', ':']).next().unwrap_or("remote");
    if host.is_empty() {
        "remote".to_string()
    } else {
        host.to_string()
    }
}

impl RouterState {
    /// Add or refresh a local workspace and make it active. The id never
    /// changes once assigned; `created_at` survives re-registration.
    pub fn upsert_local(&mut self, path: &str, name: Option<String>) -> Workspace {
        let normalized = normalize_local_path(path);
        let id = local_workspace_id(&normalized);
        let name = name.unwrap_or_else(|| infer_local_name(&normalized));
        self.upsert(Workspace {
            id,
            name,
            kind: WorkspaceKind::Local,
            path: Some(normalized),
            base_url: None,
            directory: None,
            created_at: Utc::now(),
            last_used_at: Utc::now(),
        })
    }

    /// Add or refresh a remote workspace and make it active.
    pub fn upsert_remote(
        &mut self,
        base_url: &str,
        directory: Option<String>,
        name: Option<String>,
    ) -> Workspace {
        let base_url = normalize_base_url(base_url);
        let directory = directory.unwrap_or_default();
        let id = remote_workspace_id(&base_url, &directory);
        let name = name.unwrap_or_else(|| infer_remote_name(&base_url));
        self.upsert(Workspace {
            id,
            name,
            kind: WorkspaceKind::Remote,
            path: None,
            base_url: Some(base_url),
            directory: if directory.is_empty() {
                None
            } else {
                Some(directory)
            },
            created_at: Utc::now(),
            last_used_at: Utc::now(),
        })
    }

    fn upsert(&mut self, mut workspace: Workspace) -> Workspace {
        if let Some(existing) = self.workspaces.iter_mut().find(|w| w.id == workspace.id) {
            workspace.created_at = existing.created_at;
            *existing = workspace.clone();
        } else {
            self.workspaces.push(workspace.clone());
        }
        self.active_workspace_id = workspace.id.clone();
        workspace
    }

    /// Look up a workspace by id, name, or normalized path/base URL.
    pub fn find(&self, key: &str) -> Option<&Workspace> {
        if let Some(ws) = self.workspaces.iter().find(|w| w.id == key) {
            return Some(ws);
        }
        if let Some(ws) = self.workspaces.iter().find(|w| w.name == key) {
            return Some(ws);
        }
        let as_path = normalize_local_path(key);
        if let Some(ws) = self
            .workspaces
            .iter()
            .find(|w| w.path.as_deref() == Some(as_path.as_str()))
        {
            return Some(ws);
        }
        let as_url = normalize_base_url(key);
        self.workspaces
            .iter()
            .find(|w| w.base_url.as_deref() == Some(as_url.as_str()))
    }

    /// Activate the workspace matching `key`, refreshing its
    /// `last_used_at`. Returns the activated record.
    pub fn activate(&mut self, key: &str) -> Option<Workspace> {
        let id = self.find(key)?.id.clone();
        let ws = self.workspaces.iter_mut().find(|w| w.id == id)?;
        ws.last_used_at = Utc::now();
        let snapshot = ws.clone();
        self.active_workspace_id = snapshot.id.clone();
        Some(snapshot)
    }
}

/// Repository wrapping the persisted state document.
///
/// All read-modify-write cycles go through a process-local mutex, and
/// writes take an advisory lock file, so concurrent CLI invocations never
/// interleave a partial write.
pub struct StateStore {
    path: PathBuf,
    state: Mutex<RouterState>,
}

impl StateStore {
    /// Load the state document, tolerating a missing or corrupt file.
    pub fn load(path: PathBuf) -> Self {
        let state = read_state(&path);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> RouterState {
        self.state.lock().await.clone()
    }

    /// Apply a mutation and synchronously write the document back.
    pub async fn mutate<T>(&self, f: impl FnOnce(&mut RouterState) -> T) -> Result<T> {
        let mut state = self.state.lock().await;
        let result = f(&mut state);
        state.diagnostics.updated_at = Some(Utc::now());
        write_state(&self.path, &state)?;
        Ok(result)
    }
}

/// Read the persisted state from disk without a store. Used by CLI
/// attach probes that must not race the daemon's in-memory copy.
pub fn read_state(path: &Path) -> RouterState {
    if !path.exists() {
        return RouterState::default();
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    "Corrupt state file {} ({}), starting fresh",
                    path.display(),
                    e
                );
                RouterState::default()
            }
        },
        Err(e) => {
            tracing::warn!("Unreadable state file {} ({}), starting fresh", path.display(), e);
            RouterState::default()
        }
    }
}

fn write_state(path: &Path, state: &RouterState) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::State(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let _lock = acquire_lock_waiting(path)?;
    let mut body = serde_json::to_string_pretty(state)?;
    body.push('\n');
    std::fs::write(path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn local_ids_are_deterministic_and_short() {
        let a = local_workspace_id("/tmp/demo");
        let b = local_workspace_id("/tmp/demo");
        assert_eq!(a, b);
        assert!(a.starts_with("ws-"));
        assert_eq!(a.len(), "ws-".len() + 12);
        assert!(a[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn remote_ids_differ_by_directory() {
        let a = remote_workspace_id("https://host.example:8787", "alpha");
        let b = remote_workspace_id("https://host.example:8787", "beta");
        assert_ne!(a, b);
    }

    #[test]
    fn registering_the_same_path_twice_yields_one_entry() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("demo");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.to_string_lossy().to_string();

        let mut state = RouterState::default();
        let first = state.upsert_local(&path, None);
        let second = state.upsert_local(&path, Some("renamed".to_string()));

        assert_eq!(first.id, second.id);
        assert_eq!(state.workspaces.len(), 1);
        assert_eq!(state.workspaces[0].name, "renamed");
        assert_eq!(state.workspaces[0].created_at, first.created_at);
        assert_eq!(state.active_workspace_id, first.id);
    }

    #[test]
    fn find_matches_id_name_and_path() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("demo");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.to_string_lossy().to_string();

        let mut state = RouterState::default();
        let ws = state.upsert_local(&path, None);

        assert_eq!(state.find(&ws.id).unwrap().id, ws.id);
        assert_eq!(state.find("demo").unwrap().id, ws.id);
        assert_eq!(state.find(&path).unwrap().id, ws.id);
        assert!(state.find("missing").is_none());
    }

    #[test]
    fn activate_unknown_workspace_returns_none() {
        let mut state = RouterState::default();
        assert!(state.activate("nope").is_none());
        assert_eq!(state.active_workspace_id, "");
    }

    #[test]
    fn missing_and_corrupt_files_load_as_fresh_state() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("router-state.json");

        let fresh = read_state(&path);
        assert!(fresh.workspaces.is_empty());

        std::fs::write(&path, "{not json").unwrap();
        let recovered = read_state(&path);
        assert!(recovered.workspaces.is_empty());
        assert_eq!(recovered.schema_version, STATE_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn mutations_are_persisted_pretty_and_newline_terminated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("router-state.json");
        let store = StateStore::load(path.clone());

        let ws = store
            .mutate(|state| state.upsert_remote("https://host.example/", None, None))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with('\n'));
        assert!(raw.contains("schemaVersion"));
        assert!(raw.contains(&ws.id));

        let reloaded = read_state(&path);
        assert_eq!(reloaded.workspaces.len(), 1);
        assert_eq!(reloaded.workspaces[0].base_url.as_deref(), Some("https://host.example"));
        assert_eq!(reloaded.active_workspace_id, ws.id);
    }
}
