//! Configuration for the openwork orchestrator.

use std::path::PathBuf;

use crate::error::Error;
use crate::sidecar::SourcePreference;
pub type Result<T> = std::result::Result<T, Error>;

/// Preferred daemon port; falls back to an ephemeral port when taken.
pub const DEFAULT_DAEMON_PORT: u16 = 8787;

/// Default host the daemon binds and children listen on.
pub const DEFAULT_DAEMON_HOST: &str = "127.0.0.1";

/// Default release manifest describing per-platform sidecar assets.
pub const DEFAULT_MANIFEST_URL: &str = "https://releases.openwork.dev/sidecars/manifest.json";

/// Default base URL assets are fetched from when the manifest entry
/// carries only an asset name.
pub const DEFAULT_ASSET_BASE_URL: &str = "https://releases.openwork.dev/sidecars";

/// Get the openwork home directory (~/.openwork).
pub fn default_data_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".openwork"))
}

/// Resolved orchestrator configuration, assembled from CLI flags and
/// environment fallbacks. Immutable for the lifetime of a run.
#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub sidecar_dir: PathBuf,
    pub sidecar_source: SourcePreference,
    pub sidecar_manifest: String,
    pub sidecar_base_url: String,
    pub daemon_host: String,
    pub daemon_port: Option<u16>,
    pub allow_external: bool,
    pub engine_bin: Option<PathBuf>,
    pub server_bin: Option<PathBuf>,
    pub bot_bin: Option<PathBuf>,
    pub json_output: bool,
}

impl Config {
    /// Path of the persisted router state document.
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("router-state.json")
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            sidecar_dir: dir.join("sidecars"),
            sidecar_source: SourcePreference::Auto,
            sidecar_manifest: DEFAULT_MANIFEST_URL.to_string(),
            sidecar_base_url: DEFAULT_ASSET_BASE_URL.to_string(),
            daemon_host: DEFAULT_DAEMON_HOST.to_string(),
            daemon_port: None,
            allow_external: false,
            engine_bin: None,
            server_bin: None,
            bot_bin: None,
            json_output: false,
        }
    }

    #[test]
    fn state_path_lives_under_data_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = test_config(tmp.path());
        assert_eq!(config.state_path(), tmp.path().join("router-state.json"));
        assert_eq!(config.log_dir(), tmp.path().join("logs"));
    }
}
