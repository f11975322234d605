//! Sidecar binary acquisition: resolution, manifest, download.

pub mod download;
pub mod manifest;
pub mod resolver;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use manifest::{ManifestCache, RemoteAsset, RemoteManifest, RemoteManifestEntry};
pub use resolver::Resolver;

/// Logical name of the engine sidecar.
pub const ENGINE_SERVICE: &str = "opencode";

/// Logical name of the workspace server sidecar.
pub const SERVER_SERVICE: &str = "openwork-server";

/// Logical name of the optional companion bot sidecar.
pub const BOT_SERVICE: &str = "owpenbot";

/// Where a resolved binary came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinarySource {
    Bundled,
    Downloaded,
    External,
}

/// Caller preference for which acquisition source to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum SourcePreference {
    Auto,
    Bundled,
    Downloaded,
    External,
}

impl SourcePreference {
    /// Flag value form, for re-exec of the daemon with inherited options.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePreference::Auto => "auto",
            SourcePreference::Bundled => "bundled",
            SourcePreference::Downloaded => "downloaded",
            SourcePreference::External => "external",
        }
    }
}

/// A resolved sidecar executable. Immutable once resolved for a run.
#[derive(Clone, Debug)]
pub struct SidecarBinary {
    pub path: PathBuf,
    pub source: BinarySource,
    pub expected_version: Option<String>,
    pub actual_version: Option<String>,
}

/// Platform target string used as the manifest key, e.g. `linux-x64`.
pub fn platform_target() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{}-{}", os, arch)
}

/// Executable file name for a service on the current platform.
pub fn executable_name(service: &str) -> String {
    format!("{}{}", service, std::env::consts::EXE_SUFFIX)
}

/// Environment variable that overrides the expected version of a service,
/// e.g. `OPENWORK_OPENCODE_VERSION`.
pub fn version_override_var(service: &str) -> String {
    format!(
        "OPENWORK_{}_VERSION",
        service.to_uppercase().replace('-', "_")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_target_is_os_dash_arch() {
        let target = platform_target();
        assert!(target.contains('-'));
        assert!(!target.contains("x86_64"), "arch should be normalized");
        assert!(!target.contains("macos"), "os should be normalized");
    }

    #[test]
    fn version_override_var_upper_snakes_service_names() {
        assert_eq!(version_override_var("opencode"), "OPENWORK_OPENCODE_VERSION");
        assert_eq!(
            version_override_var("openwork-server"),
            "OPENWORK_OPENWORK_SERVER_VERSION"
        );
    }
}
