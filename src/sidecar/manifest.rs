//! Remote release manifest: model and per-URL fetch cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};

use crate::error::{Error, Result};

const MANIFEST_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One downloadable asset for a platform target.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAsset {
    #[serde(default)]
    pub asset_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Release entry for one service: a version plus its per-platform assets.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteManifestEntry {
    pub version: String,
    #[serde(default)]
    pub targets: HashMap<String, RemoteAsset>,
}

/// The whole release manifest, keyed by logical service name.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteManifest {
    #[serde(default)]
    pub services: HashMap<String, RemoteManifestEntry>,
}

/// Per-URL manifest cache, scoped to the process lifetime.
///
/// Concurrent callers for the same URL share one in-flight request; a
/// successful response is never fetched again for the same URL.
#[derive(Default)]
pub struct ManifestCache {
    inner: Mutex<HashMap<String, Arc<OnceCell<Arc<RemoteManifest>>>>>,
}

impl ManifestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or reuse) the manifest at `url`.
    pub async fn fetch(&self, http: &reqwest::Client, url: &str) -> Result<Arc<RemoteManifest>> {
        let cell = {
            let mut inner = self.inner.lock().await;
            inner
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let manifest = cell
            .get_or_try_init(|| async {
                tracing::debug!("Fetching sidecar manifest from {}", url);
                let response = http
                    .get(url)
                    .timeout(MANIFEST_FETCH_TIMEOUT)
                    .send()
                    .await
                    .map_err(|e| Error::Download(format!("manifest fetch {}: {}", url, e)))?;
                let response = response
                    .error_for_status()
                    .map_err(|e| Error::Download(format!("manifest fetch {}: {}", url, e)))?;
                let manifest: RemoteManifest = response
                    .json()
                    .await
                    .map_err(|e| Error::Download(format!("manifest parse {}: {}", url, e)))?;
                Ok::<_, Error>(Arc::new(manifest))
            })
            .await?;

        Ok(manifest.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_deserializes_with_optional_fields() {
        let raw = r#"{
            "services": {
                "opencode": {
                    "version": "0.5.1",
                    "targets": {
                        "linux-x64": {
                            "assetName": "opencode-linux-x64.tar.gz",
                            "sha256": "abc123"
                        },
                        "darwin-arm64": {
                            "url": "https://example.invalid/opencode.zip"
                        }
                    }
                }
            }
        }"#;

        let manifest: RemoteManifest = serde_json::from_str(raw).unwrap();
        let entry = manifest.services.get("opencode").unwrap();
        assert_eq!(entry.version, "0.5.1");

        let linux = entry.targets.get("linux-x64").unwrap();
        assert_eq!(linux.asset_name.as_deref(), Some("opencode-linux-x64.tar.gz"));
        assert!(linux.url.is_none());

        let mac = entry.targets.get("darwin-arm64").unwrap();
        assert!(mac.asset_name.is_none());
        assert!(mac.sha256.is_none());
    }

    #[test]
    fn empty_manifest_is_valid() {
        let manifest: RemoteManifest = serde_json::from_str("{}").unwrap();
        assert!(manifest.services.is_empty());
    }
}
