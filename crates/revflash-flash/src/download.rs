//! Package download into quarantine and promotion to verified storage

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use revflash_core::{PackageStatus, TunePackage};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{FlashConfig, StorageConfig};
use crate::error::FlashError;

/// Local package storage split into quarantine and verified areas
///
/// Downloads always land in quarantine. Only the orchestrator moves a file
/// to the verified area, after both integrity checks have passed. The
/// store annotates each package it handles with a [`PackageStatus`].
#[derive(Debug, Clone)]
pub struct PackageStore {
    client: Client,
    quarantine: PathBuf,
    verified: PathBuf,
    statuses: Arc<Mutex<HashMap<String, PackageStatus>>>,
}

impl PackageStore {
    pub fn new(storage: &StorageConfig, client: Client) -> Self {
        Self {
            client,
            quarantine: storage.quarantine_dir(),
            verified: storage.verified_dir(),
            statuses: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a store with an HTTP client built from the configured timeouts
    pub fn from_config(config: &FlashConfig) -> Result<Self, FlashError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeouts.download_ms))
            .connect_timeout(Duration::from_millis(config.timeouts.connect_ms))
            .build()
            .map_err(|e| FlashError::Storage(format!("HTTP client: {}", e)))?;
        Ok(Self::new(&config.storage, client))
    }

    pub fn quarantine_dir(&self) -> &Path {
        &self.quarantine
    }

    pub fn verified_dir(&self) -> &Path {
        &self.verified
    }

    /// Where `package` lands while it awaits verification
    pub fn quarantine_path(&self, package: &TunePackage) -> PathBuf {
        self.quarantine.join(file_name(package))
    }

    /// Local status of a package, if the store has seen it
    pub fn status(&self, package_id: &str) -> Option<PackageStatus> {
        self.statuses.lock().get(package_id).copied()
    }

    fn record(&self, package: &TunePackage, status: PackageStatus) -> PackageStatus {
        self.statuses.lock().insert(package.id.clone(), status);
        status
    }

    /// Note a freshly resolved package
    pub fn register(&self, package: &TunePackage) -> PackageStatus {
        self.record(package, PackageStatus::Resolved)
    }

    /// Fetch `package` into quarantine and return the quarantined path
    ///
    /// `http(s)://` URLs are streamed over HTTP; `file://` URLs and bare paths
    /// are copied.
    pub async fn download(&self, package: &TunePackage) -> Result<PathBuf, FlashError> {
        tokio::fs::create_dir_all(&self.quarantine)
            .await
            .map_err(|e| FlashError::Storage(format!("create quarantine: {}", e)))?;
        let target = self.quarantine_path(package);

        let written = match Url::parse(&package.download_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                self.fetch(url, &target).await?
            }
            Ok(url) if url.scheme() == "file" => {
                let path = url.to_file_path().map_err(|_| {
                    FlashError::DownloadFailed(format!("bad file URL: {}", package.download_url))
                })?;
                copy_local(&path, &target).await?
            }
            Ok(url) if url.scheme().len() > 1 => {
                return Err(FlashError::DownloadFailed(format!(
                    "unsupported URL scheme: {}",
                    url.scheme()
                )))
            }
            // bare paths, including Windows drive letters that parse as a scheme
            _ => copy_local(Path::new(&package.download_url), &target).await?,
        };

        self.record(package, PackageStatus::Downloaded);
        info!(
            package = %package.id,
            bytes = written,
            path = %target.display(),
            "Package downloaded to quarantine"
        );
        Ok(target)
    }

    /// Stream the response body into `target` chunk by chunk
    async fn fetch(&self, url: Url, target: &Path) -> Result<u64, FlashError> {
        debug!(%url, "Fetching package");
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FlashError::DownloadFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlashError::DownloadFailed(format!("HTTP {} for {}", status, url)));
        }

        let write_failed =
            |e: std::io::Error| FlashError::DownloadFailed(format!("write {}: {}", target.display(), e));
        let mut file = tokio::fs::File::create(target).await.map_err(write_failed)?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FlashError::DownloadFailed(e.to_string()))?
        {
            file.write_all(&chunk).await.map_err(write_failed)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_failed)?;
        Ok(written)
    }

    /// Purge a rejected package from quarantine
    pub async fn reject(&self, quarantined: &Path, package: &TunePackage) -> PackageStatus {
        self.purge(quarantined).await;
        self.record(package, PackageStatus::Rejected)
    }

    /// Drop whatever part of `package` reached quarantine, e.g. after a
    /// download was abandoned
    pub async fn discard(&self, package: &TunePackage) {
        self.purge(&self.quarantine_path(package)).await;
        self.statuses.lock().remove(&package.id);
    }

    /// Delete a quarantined file; a missing file is not an error
    pub async fn purge(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!(path = %path.display(), "Purged quarantined package"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to purge quarantined package"),
        }
    }

    /// Move a verified package out of quarantine
    pub async fn promote(
        &self,
        quarantined: &Path,
        package: &TunePackage,
    ) -> Result<PathBuf, FlashError> {
        tokio::fs::create_dir_all(&self.verified)
            .await
            .map_err(|e| FlashError::Storage(format!("create verified dir: {}", e)))?;
        let target = self.verified.join(file_name(package));
        tokio::fs::rename(quarantined, &target)
            .await
            .map_err(|e| FlashError::Storage(format!("promote {}: {}", quarantined.display(), e)))?;
        self.record(package, PackageStatus::Verified);
        debug!(path = %target.display(), "Package promoted to verified storage");
        Ok(target)
    }
}

async fn copy_local(source: &Path, target: &Path) -> Result<u64, FlashError> {
    tokio::fs::copy(source, target)
        .await
        .map_err(|e| FlashError::DownloadFailed(format!("read {}: {}", source.display(), e)))
}

fn file_name(package: &TunePackage) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect()
    };
    format!("{}-{}.bin", sanitize(&package.id), sanitize(&package.version_label))
}
