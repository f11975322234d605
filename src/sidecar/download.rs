//! Sidecar asset download: checksum verification, caching, archive extraction.

use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::sidecar::manifest::{ManifestCache, RemoteAsset};
use crate::sidecar::executable_name;

const ASSET_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// A binary produced by the download pipeline.
#[derive(Clone, Debug)]
pub struct DownloadedBinary {
    pub path: PathBuf,
    pub version: String,
}

/// Archive formats a sidecar asset may ship as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    TarGz,
}

fn archive_kind(asset_name: &str) -> Option<ArchiveKind> {
    let lower = asset_name.to_lowercase();
    if lower.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else {
        None
    }
}

/// Download (or reuse from cache) the asset for `service` on `target`.
///
/// Returns `Ok(None)` when the manifest has no entry for the service or no
/// asset for the platform target, so the caller can fall through to another
/// acquisition source.
pub async fn download(
    http: &reqwest::Client,
    manifests: &ManifestCache,
    service: &str,
    target: &str,
    cache_dir: &Path,
    manifest_url: &str,
    base_url: &str,
) -> Result<Option<DownloadedBinary>> {
    let manifest = manifests.fetch(http, manifest_url).await?;
    let Some(entry) = manifest.services.get(service) else {
        tracing::debug!("Manifest has no entry for {}", service);
        return Ok(None);
    };
    let Some(asset) = entry.targets.get(target) else {
        tracing::debug!("Manifest entry for {} has no target {}", service, target);
        return Ok(None);
    };

    let asset_name = resolve_asset_name(asset, service);
    let archive = archive_kind(&asset_name);
    let dir = cache_dir.join(service).join(&entry.version).join(target);

    // Archive assets cache the extracted executable, not the archive, so
    // the declared checksum (which covers the archive) only applies to
    // bare-binary assets on reuse.
    let final_name = match archive {
        Some(_) => executable_name(service),
        None => asset_name.clone(),
    };
    let final_path = dir.join(&final_name);

    if final_path.is_file() {
        let reusable = match (archive, asset.sha256.as_deref()) {
            (None, Some(expected)) => {
                let actual = sha256_file(&final_path)?;
                if actual.eq_ignore_ascii_case(expected) {
                    true
                } else {
                    tracing::warn!(
                        "Cached {} checksum mismatch (expected {}, got {}), re-downloading",
                        final_path.display(),
                        expected,
                        actual
                    );
                    std::fs::remove_file(&final_path)?;
                    false
                }
            }
            _ => true,
        };
        if reusable {
            tracing::debug!("Reusing cached {}", final_path.display());
            return Ok(Some(DownloadedBinary {
                path: final_path,
                version: entry.version.clone(),
            }));
        }
    }

    std::fs::create_dir_all(&dir)?;
    let url = asset_url(asset, base_url, service, &entry.version, &asset_name);

    // A checksum mismatch gets exactly one automatic re-download.
    for attempt in 1..=2 {
        let bytes = fetch_asset(http, &url).await?;

        if let Some(expected) = asset.sha256.as_deref() {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                if attempt == 1 {
                    tracing::warn!(
                        "Downloaded {} checksum mismatch (expected {}, got {}), retrying once",
                        asset_name,
                        expected,
                        actual
                    );
                    continue;
                }
                return Err(Error::Integrity(format!(
                    "{} from {}: expected sha256 {}, got {}",
                    asset_name, url, expected, actual
                )));
            }
        }

        match archive {
            Some(kind) => install_from_archive(kind, &bytes, service, &final_path)?,
            None => write_atomic(&bytes, &final_path)?,
        }
        mark_executable(&final_path)?;

        tracing::info!(
            "Downloaded {} {} for {} to {}",
            service,
            entry.version,
            target,
            final_path.display()
        );
        return Ok(Some(DownloadedBinary {
            path: final_path,
            version: entry.version.clone(),
        }));
    }

    Err(Error::Integrity(format!(
        "{} from {}: retries exhausted",
        asset_name, url
    )))
}

fn resolve_asset_name(asset: &RemoteAsset, service: &str) -> String {
    if let Some(name) = asset.asset_name.as_deref() {
        return name.to_string();
    }
    if let Some(url) = asset.url.as_deref() {
        if let Some(name) = url.rsplit('/').next() {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    executable_name(service)
}

fn asset_url(
    asset: &RemoteAsset,
    base_url: &str,
    service: &str,
    version: &str,
    asset_name: &str,
) -> String {
    match asset.url.as_deref() {
        Some(url) => url.to_string(),
        None => format!(
            "{}/{}/{}/{}",
            base_url.trim_end_matches('/'),
            service,
            version,
            asset_name
        ),
    }
}

async fn fetch_asset(http: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = http
        .get(url)
        .timeout(ASSET_FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::Download(format!("{}: {}", url, e)))?
        .error_for_status()
        .map_err(|e| Error::Download(format!("{}: {}", url, e)))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::Download(format!("{}: {}", url, e)))?;
    Ok(bytes.to_vec())
}

/// Write `bytes` to a temp file in the target directory and atomically
/// rename into place; the final path never holds a partial write.
fn write_atomic(bytes: &[u8], final_path: &Path) -> Result<()> {
    let dir = final_path
        .parent()
        .ok_or_else(|| Error::Download(format!("no parent dir for {}", final_path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(final_path)
        .map_err(|e| Error::Download(format!("rename into {}: {}", final_path.display(), e)))?;
    Ok(())
}

/// Extract an archive into scratch space, locate the service executable,
/// and install it at `final_path`. The scratch directory is removed on all
/// exit paths; the archive itself only ever exists in memory.
fn install_from_archive(
    kind: ArchiveKind,
    bytes: &[u8],
    service: &str,
    final_path: &Path,
) -> Result<()> {
    let scratch = tempfile::TempDir::new()?;

    match kind {
        ArchiveKind::Zip => extract_zip_bytes(bytes, scratch.path())?,
        ArchiveKind::TarGz => extract_tar_gz_bytes(bytes, scratch.path())?,
    }

    let wanted = executable_name(service);
    let found = find_executable(scratch.path(), &wanted)?.ok_or_else(|| {
        Error::Download(format!("archive for {} does not contain {}", service, wanted))
    })?;

    let dir = final_path
        .parent()
        .ok_or_else(|| Error::Download(format!("no parent dir for {}", final_path.display())))?;
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut src = std::fs::File::open(&found)?;
        let mut dst = tmp.as_file();
        std::io::copy(&mut src, &mut dst)?;
        dst.flush()?;
    }
    tmp.persist(final_path)
        .map_err(|e| Error::Download(format!("rename into {}: {}", final_path.display(), e)))?;
    Ok(())
}

fn is_safe_relative_path(path: &Path) -> bool {
    use std::path::Component;
    !path.is_absolute()
        && !path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        })
}

fn extract_zip_bytes(bytes: &[u8], output_dir: &Path) -> Result<()> {
    let reader = Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| Error::Download(format!("invalid zip archive: {}", e)))?;

    for i in 0..archive.len() {
        let mut f = archive
            .by_index(i)
            .map_err(|e| Error::Download(format!("zip entry {}: {}", i, e)))?;
        let Some(raw_name) = f.enclosed_name().map(|p| p.to_path_buf()) else {
            continue;
        };
        if !is_safe_relative_path(&raw_name) {
            continue;
        }
        let outpath = output_dir.join(raw_name);
        if f.is_dir() {
            std::fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&outpath)?;
            std::io::copy(&mut f, &mut out)?;
        }
    }
    Ok(())
}

fn extract_tar_gz_bytes(bytes: &[u8], output_dir: &Path) -> Result<()> {
    let cursor = Cursor::new(bytes);
    let decoder = flate2::read::GzDecoder::new(cursor);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        if !is_safe_relative_path(&path) {
            continue;
        }
        let outpath = output_dir.join(path);
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&outpath)?;
    }
    Ok(())
}

/// Locate a file named exactly `wanted` under `root`.
///
/// Traversal uses an explicit worklist with sorted directory entries so
/// the result is deterministic and stack usage stays bounded.
fn find_executable(root: &Path, wanted: &str) -> Result<Option<PathBuf>> {
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                queue.push_back(path);
            } else if entry.file_name().to_string_lossy() == wanted {
                return Ok(Some(path));
            }
        }
    }
    Ok(None)
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::routing::get;
    use axum::Router;

    #[test]
    fn archive_kind_by_suffix() {
        assert_eq!(archive_kind("opencode-linux-x64.zip"), Some(ArchiveKind::Zip));
        assert_eq!(
            archive_kind("opencode-linux-x64.tar.gz"),
            Some(ArchiveKind::TarGz)
        );
        assert_eq!(archive_kind("opencode.TGZ"), Some(ArchiveKind::TarGz));
        assert_eq!(archive_kind("openwork-server-linux-x64"), None);
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn find_executable_walks_nested_dirs_in_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::create_dir_all(tmp.path().join("z")).unwrap();
        std::fs::write(tmp.path().join("a/b/opencode"), b"bin").unwrap();
        std::fs::write(tmp.path().join("z/readme.txt"), b"docs").unwrap();

        let found = find_executable(tmp.path(), "opencode").unwrap();
        assert_eq!(found, Some(tmp.path().join("a/b/opencode")));

        let missing = find_executable(tmp.path(), "owpenbot").unwrap();
        assert!(missing.is_none());
    }

    fn tar_gz_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, *name, *data).unwrap();
        }
        let encoder = builder.into_inner().unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn install_from_tar_gz_archive_extracts_the_named_executable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let archive = tar_gz_with(&[
            ("docs/readme.md", b"hello".as_slice()),
            ("bin/opencode", b"#!/bin/sh\necho engine\n".as_slice()),
        ]);

        let final_path = tmp.path().join("opencode");
        install_from_archive(ArchiveKind::TarGz, &archive, "opencode", &final_path).unwrap();

        let installed = std::fs::read(&final_path).unwrap();
        assert_eq!(installed, b"#!/bin/sh\necho engine\n");
    }

    #[test]
    fn install_from_zip_archive_extracts_the_named_executable() {
        let tmp = tempfile::TempDir::new().unwrap();

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("nested/opencode", options).unwrap();
        writer.write_all(b"zip engine").unwrap();
        let archive = writer.finish().unwrap().into_inner();

        let final_path = tmp.path().join("opencode");
        install_from_archive(ArchiveKind::Zip, &archive, "opencode", &final_path).unwrap();

        assert_eq!(std::fs::read(&final_path).unwrap(), b"zip engine");
    }

    #[test]
    fn install_fails_when_archive_lacks_the_executable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let archive = tar_gz_with(&[("docs/readme.md", b"hello".as_slice())]);

        let final_path = tmp.path().join("opencode");
        let err =
            install_from_archive(ArchiveKind::TarGz, &archive, "opencode", &final_path)
                .unwrap_err();
        assert!(err.to_string().contains("does not contain"));
        assert!(!final_path.exists());
    }

    struct TestRelease {
        base_url: String,
        manifest_url: String,
        asset_hits: Arc<AtomicUsize>,
    }

    /// Serve a manifest plus one bare-binary asset from an ephemeral local
    /// HTTP listener.
    async fn serve_release(asset_body: &'static [u8], declared_sha: String) -> TestRelease {
        let asset_hits = Arc::new(AtomicUsize::new(0));
        let hits = asset_hits.clone();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);
        let manifest_url = format!("{}/manifest.json", base_url);

        let manifest = serde_json::json!({
            "services": {
                "openwork-server": {
                    "version": "1.2.0",
                    "targets": {
                        "linux-x64": {
                            "assetName": "openwork-server-linux-x64",
                            "sha256": declared_sha,
                        }
                    }
                }
            }
        })
        .to_string();

        let app = Router::new()
            .route(
                "/manifest.json",
                get(move || {
                    let manifest = manifest.clone();
                    async move { manifest }
                }),
            )
            .route(
                "/openwork-server/1.2.0/openwork-server-linux-x64",
                get(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    async move { asset_body.to_vec() }
                }),
            );

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        TestRelease {
            base_url,
            manifest_url,
            asset_hits,
        }
    }

    #[tokio::test]
    async fn download_caches_and_reuses_verified_assets() {
        let body: &'static [u8] = b"server binary bytes";
        let release = serve_release(body, sha256_hex(body)).await;
        let cache_dir = tempfile::TempDir::new().unwrap();
        let http = reqwest::Client::new();
        let manifests = ManifestCache::new();

        let first = download(
            &http,
            &manifests,
            "openwork-server",
            "linux-x64",
            cache_dir.path(),
            &release.manifest_url,
            &release.base_url,
        )
        .await
        .unwrap()
        .expect("asset should resolve");
        assert_eq!(first.version, "1.2.0");
        assert_eq!(std::fs::read(&first.path).unwrap(), body);
        assert_eq!(release.asset_hits.load(Ordering::SeqCst), 1);

        // Second call reuses the verified cached file without re-fetching.
        let second = download(
            &http,
            &manifests,
            "openwork-server",
            "linux-x64",
            cache_dir.path(),
            &release.manifest_url,
            &release.base_url,
        )
        .await
        .unwrap()
        .expect("asset should resolve");
        assert_eq!(second.path, first.path);
        assert_eq!(release.asset_hits.load(Ordering::SeqCst), 1);

        // Corrupt the cached file: it is deleted and fetched again.
        std::fs::write(&first.path, b"corrupted").unwrap();
        let third = download(
            &http,
            &manifests,
            "openwork-server",
            "linux-x64",
            cache_dir.path(),
            &release.manifest_url,
            &release.base_url,
        )
        .await
        .unwrap()
        .expect("asset should resolve");
        assert_eq!(std::fs::read(&third.path).unwrap(), body);
        assert_eq!(release.asset_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn download_retries_once_then_fails_on_integrity_mismatch() {
        let body: &'static [u8] = b"never matches";
        let release = serve_release(body, sha256_hex(b"something else")).await;
        let cache_dir = tempfile::TempDir::new().unwrap();
        let http = reqwest::Client::new();
        let manifests = ManifestCache::new();

        let err = download(
            &http,
            &manifests,
            "openwork-server",
            "linux-x64",
            cache_dir.path(),
            &release.manifest_url,
            &release.base_url,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Integrity(_)), "got: {err}");
        assert_eq!(release.asset_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn download_returns_none_for_unknown_service_or_target() {
        let body: &'static [u8] = b"bytes";
        let release = serve_release(body, sha256_hex(body)).await;
        let cache_dir = tempfile::TempDir::new().unwrap();
        let http = reqwest::Client::new();
        let manifests = ManifestCache::new();

        let missing_service = download(
            &http,
            &manifests,
            "owpenbot",
            "linux-x64",
            cache_dir.path(),
            &release.manifest_url,
            &release.base_url,
        )
        .await
        .unwrap();
        assert!(missing_service.is_none());

        let missing_target = download(
            &http,
            &manifests,
            "openwork-server",
            "darwin-arm64",
            cache_dir.path(),
            &release.manifest_url,
            &release.base_url,
        )
        .await
        .unwrap();
        assert!(missing_target.is_none());
    }
}
