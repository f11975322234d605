//! Binary resolution policy: bundled, downloaded, or external sidecars.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::sidecar::download::{self, sha256_file};
use crate::sidecar::manifest::ManifestCache;
use crate::sidecar::{
    executable_name, platform_target, version_override_var, BinarySource, SidecarBinary,
    SourcePreference,
};

/// Local integrity manifest shipped next to bundled sidecars.
const BUNDLED_MANIFEST_NAME: &str = "sidecars.json";

#[derive(Clone, Debug, Deserialize)]
struct BundledEntry {
    version: String,
    sha256: String,
}

type BundledManifest = HashMap<String, BundledEntry>;

/// Resolves sidecar executables according to the configured source
/// preference. Stateless apart from the borrowed manifest cache.
pub struct Resolver<'a> {
    pub config: &'a Config,
    pub http: &'a reqwest::Client,
    pub manifests: &'a ManifestCache,
}

impl Resolver<'_> {
    /// Decide which executable to use for `service`.
    ///
    /// `explicit` is an operator-supplied path; it requires
    /// `allow_external` and an `auto`/`external` source preference, checked
    /// before any I/O happens.
    pub async fn resolve(&self, service: &str, explicit: Option<&Path>) -> Result<SidecarBinary> {
        let preference = self.config.sidecar_source;

        if explicit.is_some() {
            if !self.config.allow_external {
                return Err(Error::Config(format!(
                    "explicit {} binary requires --allow-external",
                    service
                )));
            }
            if !matches!(
                preference,
                SourcePreference::Auto | SourcePreference::External
            ) {
                return Err(Error::Config(format!(
                    "explicit {} binary conflicts with --sidecar-source {:?}",
                    service, preference
                )));
            }
        }

        let mut binary = match preference {
            SourcePreference::Bundled => self.resolve_bundled(service)?,
            SourcePreference::Downloaded => self.resolve_downloaded(service).await?,
            SourcePreference::External => self.resolve_external(service, explicit)?,
            SourcePreference::Auto => self.resolve_auto(service, explicit).await?,
        };

        // An environment override trumps whatever the winning source knew.
        if let Ok(version) = std::env::var(version_override_var(service)) {
            let version = version.trim().to_string();
            if !version.is_empty() {
                binary.expected_version = Some(version);
            }
        }
        if binary.expected_version.is_none() {
            binary.expected_version = self.bundled_version_hint(service);
        }

        tracing::debug!(
            "Resolved {} to {} (source {:?}, expected version {:?})",
            service,
            binary.path.display(),
            binary.source,
            binary.expected_version
        );
        Ok(binary)
    }

    async fn resolve_auto(&self, service: &str, explicit: Option<&Path>) -> Result<SidecarBinary> {
        let mut attempts: Vec<String> = Vec::new();

        match self.resolve_bundled(service) {
            Ok(binary) => return Ok(binary),
            Err(e) => attempts.push(format!("bundled: {}", e)),
        }

        // An operator-supplied path outranks a network download.
        if explicit.is_some() {
            match self.resolve_external(service, explicit) {
                Ok(binary) => return Ok(binary),
                Err(e) => attempts.push(format!("external: {}", e)),
            }
        }

        match self.resolve_downloaded(service).await {
            Ok(binary) => return Ok(binary),
            Err(e) => attempts.push(format!("downloaded: {}", e)),
        }

        if self.config.allow_external {
            match self.resolve_external(service, None) {
                Ok(binary) => return Ok(binary),
                Err(e) => attempts.push(format!("external: {}", e)),
            }
        } else {
            attempts.push("external: not allowed (pass --allow-external)".to_string());
        }

        Err(Error::ResolutionExhausted {
            service: service.to_string(),
            detail: attempts.join("; "),
        })
    }

    fn resolve_bundled(&self, service: &str) -> Result<SidecarBinary> {
        let dirs = bundled_search_dirs();
        resolve_bundled_in(service, &dirs)
    }

    async fn resolve_downloaded(&self, service: &str) -> Result<SidecarBinary> {
        let target = platform_target();
        let downloaded = download::download(
            self.http,
            self.manifests,
            service,
            &target,
            &self.config.sidecar_dir,
            &self.config.sidecar_manifest,
            &self.config.sidecar_base_url,
        )
        .await?;

        match downloaded {
            Some(binary) => Ok(SidecarBinary {
                path: binary.path,
                source: BinarySource::Downloaded,
                expected_version: Some(binary.version),
                actual_version: None,
            }),
            None => Err(Error::Download(format!(
                "no release asset for {} on {}",
                service, target
            ))),
        }
    }

    fn resolve_external(&self, service: &str, explicit: Option<&Path>) -> Result<SidecarBinary> {
        if !self.config.allow_external {
            return Err(Error::Config(format!(
                "external {} binary requires --allow-external",
                service
            )));
        }

        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "{} does not exist or is not a file",
                    path.display()
                )));
            }
            return Ok(external_binary(path.to_path_buf()));
        }

        // Well-known fallbacks: a local build output, then PATH.
        let local_build = PathBuf::from("target")
            .join("release")
            .join(executable_name(service));
        if local_build.is_file() {
            return Ok(external_binary(local_build));
        }

        match which::which(service) {
            Ok(path) => Ok(external_binary(path)),
            Err(_) => Err(Error::NotFound(format!(
                "{} not found on PATH or in local build output",
                service
            ))),
        }
    }

    fn bundled_version_hint(&self, service: &str) -> Option<String> {
        for dir in bundled_search_dirs() {
            if let Some(manifest) = read_bundled_manifest(&dir) {
                if let Some(entry) = manifest.get(service) {
                    return Some(entry.version.clone());
                }
            }
        }
        None
    }

    /// Run `<binary> --version`, record the reported version, and fail on a
    /// mismatch with the expected version. Running the wrong build
    /// invalidates every downstream guarantee, so a mismatch is fatal.
    pub async fn verify_version(&self, service: &str, binary: &mut SidecarBinary) -> Result<()> {
        let output = tokio::process::Command::new(&binary.path)
            .arg("--version")
            .output()
            .await
            .map_err(|e| Error::Spawn {
                service: service.to_string(),
                source: e,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let actual = if !stdout.is_empty() {
            stdout
        } else {
            stderr
        };
        if actual.is_empty() {
            return Err(Error::Other(format!(
                "{} did not report a version",
                binary.path.display()
            )));
        }
        binary.actual_version = Some(actual.clone());

        if let Some(expected) = binary.expected_version.as_deref() {
            if !versions_match(expected, &actual) {
                return Err(Error::VersionMismatch {
                    service: service.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

fn external_binary(path: PathBuf) -> SidecarBinary {
    SidecarBinary {
        path,
        source: BinarySource::External,
        expected_version: None,
        actual_version: None,
    }
}

/// Directories searched for bundled sidecars: next to the current
/// executable and in its `sidecars/` subdirectory.
fn bundled_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            dirs.push(dir.to_path_buf());
            dirs.push(dir.join("sidecars"));
        }
    }
    dirs
}

fn read_bundled_manifest(dir: &Path) -> Option<BundledManifest> {
    let raw = std::fs::read_to_string(dir.join(BUNDLED_MANIFEST_NAME)).ok()?;
    serde_json::from_str(&raw).ok()
}

fn resolve_bundled_in(service: &str, dirs: &[PathBuf]) -> Result<SidecarBinary> {
    let name = executable_name(service);

    for dir in dirs {
        let candidate = dir.join(&name);
        if !candidate.is_file() {
            continue;
        }

        let manifest = read_bundled_manifest(dir).ok_or_else(|| {
            Error::Integrity(format!(
                "bundled {} has no integrity manifest ({} missing in {})",
                service,
                BUNDLED_MANIFEST_NAME,
                dir.display()
            ))
        })?;
        let entry = manifest.get(service).ok_or_else(|| {
            Error::Integrity(format!(
                "bundled integrity manifest has no entry for {}",
                service
            ))
        })?;

        let actual = sha256_file(&candidate)?;
        if !actual.eq_ignore_ascii_case(&entry.sha256) {
            return Err(Error::Integrity(format!(
                "bundled {} checksum mismatch: expected {}, got {}",
                candidate.display(),
                entry.sha256,
                actual
            )));
        }

        return Ok(SidecarBinary {
            path: candidate,
            source: BinarySource::Bundled,
            expected_version: Some(entry.version.clone()),
            actual_version: None,
        });
    }

    Err(Error::ResolutionExhausted {
        service: service.to_string(),
        detail: format!(
            "bundled sidecar not present (requires a bundled build); looked in {}",
            dirs.iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    })
}

fn versions_match(expected: &str, actual: &str) -> bool {
    let norm = |s: &str| s.trim().trim_start_matches('v').to_string();
    norm(expected) == norm(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_ASSET_BASE_URL, DEFAULT_DAEMON_HOST};
    use crate::sidecar::download::sha256_hex;

    fn config(allow_external: bool, source: SourcePreference) -> Config {
        Config {
            data_dir: PathBuf::from("/nonexistent"),
            sidecar_dir: PathBuf::from("/nonexistent/sidecars"),
            sidecar_source: source,
            // Unroutable; resolution tests must never reach the network.
            sidecar_manifest: "http://127.0.0.1:1/manifest.json".to_string(),
            sidecar_base_url: DEFAULT_ASSET_BASE_URL.to_string(),
            daemon_host: DEFAULT_DAEMON_HOST.to_string(),
            daemon_port: None,
            allow_external,
            engine_bin: None,
            server_bin: None,
            bot_bin: None,
            json_output: false,
        }
    }

    fn write_bundled(dir: &Path, service: &str, contents: &[u8], sha: &str) {
        std::fs::write(dir.join(executable_name(service)), contents).unwrap();
        let manifest = serde_json::json!({
            service: { "version": "2.0.0", "sha256": sha }
        });
        std::fs::write(
            dir.join(BUNDLED_MANIFEST_NAME),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn bundled_resolves_when_checksum_matches() {
        let tmp = tempfile::TempDir::new().unwrap();
        let contents = b"engine bytes";
        write_bundled(tmp.path(), "opencode", contents, &sha256_hex(contents));

        let binary =
            resolve_bundled_in("opencode", &[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(binary.source, BinarySource::Bundled);
        assert_eq!(binary.expected_version.as_deref(), Some("2.0.0"));
    }

    #[test]
    fn bundled_fails_hard_on_checksum_mismatch() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_bundled(tmp.path(), "opencode", b"engine bytes", &sha256_hex(b"other"));

        let err = resolve_bundled_in("opencode", &[tmp.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)), "got: {err}");
    }

    #[test]
    fn bundled_absence_names_the_bundled_build_requirement() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = resolve_bundled_in("opencode", &[tmp.path().to_path_buf()]).unwrap_err();
        assert!(err.to_string().contains("bundled build"), "got: {err}");
    }

    #[tokio::test]
    async fn bundled_preference_fails_without_touching_the_network() {
        let config = config(false, SourcePreference::Bundled);
        let http = reqwest::Client::new();
        let manifests = ManifestCache::new();
        let resolver = Resolver {
            config: &config,
            http: &http,
            manifests: &manifests,
        };

        // The test binary dir carries no bundled sidecars; the unroutable
        // manifest URL would surface as a download error if the resolver
        // ever fell through to the network.
        let err = resolver.resolve("opencode", None).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bundled build"), "got: {message}");
        assert!(!message.contains("manifest"), "got: {message}");
    }

    #[tokio::test]
    async fn explicit_path_requires_allow_external() {
        let config = config(false, SourcePreference::Auto);
        let http = reqwest::Client::new();
        let manifests = ManifestCache::new();
        let resolver = Resolver {
            config: &config,
            http: &http,
            manifests: &manifests,
        };

        let err = resolver
            .resolve("opencode", Some(Path::new("/usr/bin/true")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got: {err}");
    }

    #[tokio::test]
    async fn explicit_path_conflicts_with_non_external_preference() {
        let config = config(true, SourcePreference::Downloaded);
        let http = reqwest::Client::new();
        let manifests = ManifestCache::new();
        let resolver = Resolver {
            config: &config,
            http: &http,
            manifests: &manifests,
        };

        let err = resolver
            .resolve("opencode", Some(Path::new("/usr/bin/true")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got: {err}");
    }

    #[tokio::test]
    async fn explicit_external_path_resolves() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bin = tmp.path().join("opencode");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();

        let config = config(true, SourcePreference::External);
        let http = reqwest::Client::new();
        let manifests = ManifestCache::new();
        let resolver = Resolver {
            config: &config,
            http: &http,
            manifests: &manifests,
        };

        let binary = resolver.resolve("opencode", Some(&bin)).await.unwrap();
        assert_eq!(binary.source, BinarySource::External);
        assert_eq!(binary.path, bin);
    }

    #[test]
    fn versions_match_ignores_leading_v() {
        assert!(versions_match("1.2.3", "v1.2.3"));
        assert!(versions_match("v1.2.3", "1.2.3 "));
        assert!(!versions_match("1.2.3", "1.2.4"));
    }
}
