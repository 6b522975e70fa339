//! Tune catalogs: remote over HTTP, or a local YAML index

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use revflash_core::{
    CollaboratorError, CollaboratorResult, PackageCatalog, TunePackage, VersionSelector,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::{RemoteConfig, TimeoutsConfig};
use crate::remote::RemoteClient;

/// Catalog reached over HTTP
///
/// `GET /marketplace/tunes/{tune}/versions/{version|latest}/`
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    remote: RemoteClient,
}

impl HttpCatalog {
    pub fn new(remote: &RemoteConfig, timeouts: &TimeoutsConfig) -> CollaboratorResult<Self> {
        let remote = RemoteClient::new(remote, timeouts)?;
        info!("Catalog client created for {}", remote.base_url());
        Ok(Self { remote })
    }
}

#[async_trait]
impl PackageCatalog for HttpCatalog {
    #[instrument(skip(self))]
    async fn resolve(
        &self,
        tune_id: &str,
        selector: &VersionSelector,
    ) -> CollaboratorResult<TunePackage> {
        let url = self.remote.url(&format!(
            "marketplace/tunes/{}/versions/{}/",
            tune_id,
            selector.as_path_segment()
        ))?;
        let response = self.remote.send(self.remote.get(url)).await?;
        let package: TunePackage = self.remote.handle_response(response).await?;
        debug!(package = %package.id, version = %package.version_label, "Package resolved");
        Ok(package)
    }
}

/// On-disk catalog index
///
/// ```yaml
/// tunes:
///   stage-1:
///     - id: stage-1-v1
///       version_label: "1.0.0"
///       download_url: packages/stage-1-1.0.0.bin
///       expected_hash: "9f86d0..."
///       signature: "base64..."
///       public_key_id: rev_key_v1
/// ```
///
/// Versions are listed oldest first; `latest` picks the last entry.
/// Relative download paths are resolved against the index's directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileCatalog {
    #[serde(default)]
    pub tunes: HashMap<String, Vec<TunePackage>>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an index file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> CollaboratorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CollaboratorError::Unreachable(format!("{}: {}", path.display(), e)))?;
        let mut catalog = Self::from_yaml(&content)?;

        if let Some(base) = path.parent() {
            catalog.resolve_relative_paths(base);
        }
        Ok(catalog)
    }

    pub fn from_yaml(yaml: &str) -> CollaboratorResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))
    }

    /// Register a package version for `tune_id`
    pub fn insert(&mut self, tune_id: impl Into<String>, package: TunePackage) {
        self.tunes.entry(tune_id.into()).or_default().push(package);
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        for package in self.tunes.values_mut().flatten() {
            let url = &package.download_url;
            if url.contains("://") || Path::new(url).is_absolute() {
                continue;
            }
            let joined: PathBuf = base.join(url);
            package.download_url = joined.display().to_string();
        }
    }
}

#[async_trait]
impl PackageCatalog for FileCatalog {
    async fn resolve(
        &self,
        tune_id: &str,
        selector: &VersionSelector,
    ) -> CollaboratorResult<TunePackage> {
        let versions = self
            .tunes
            .get(tune_id)
            .ok_or_else(|| CollaboratorError::NotFound(format!("tune {}", tune_id)))?;

        let found = match selector {
            VersionSelector::Latest => versions.last(),
            VersionSelector::Exact(_) => versions.iter().find(|p| selector.accepts(p)),
        };

        found
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("tune {} version {}", tune_id, selector)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const INDEX: &str = r#"
tunes:
  stage-1:
    - id: s1-100
      version_label: "1.0.0"
      download_url: packages/s1-100.bin
      expected_hash: "aa"
      signature: "sig"
      public_key_id: rev_key_v1
    - id: s1-110
      version_label: "1.1.0"
      download_url: "https://cdn.example.com/s1-110.bin"
      tune_hash_sha256: "bb"
      signature_b64: "sig"
      signing_key_id: rev_key_v2
"#;

    #[tokio::test]
    async fn test_latest_and_exact() {
        let catalog = FileCatalog::from_yaml(INDEX).unwrap();

        let latest = catalog.resolve("stage-1", &VersionSelector::Latest).await.unwrap();
        assert_eq!(latest.id, "s1-110");
        assert_eq!(latest.expected_hash, "bb");
        assert_eq!(latest.public_key_id, "rev_key_v2");

        let exact = catalog
            .resolve("stage-1", &VersionSelector::Exact("1.0.0".into()))
            .await
            .unwrap();
        assert_eq!(exact.id, "s1-100");
    }

    #[tokio::test]
    async fn test_exact_version_is_never_substituted() {
        let catalog = FileCatalog::from_yaml(INDEX).unwrap();
        let err = catalog
            .resolve("stage-1", &VersionSelector::Exact("2.0.0".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::NotFound(_)));

        let err = catalog.resolve("stage-9", &VersionSelector::Latest).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_relative_paths_resolve_against_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("index.yaml");
        std::fs::write(&index, INDEX).unwrap();

        let catalog = FileCatalog::from_yaml_file(&index).unwrap();
        let first = &catalog.tunes["stage-1"][0];
        assert_eq!(
            first.download_url,
            dir.path().join("packages/s1-100.bin").display().to_string()
        );
        assert_eq!(catalog.tunes["stage-1"][1].download_url, "https://cdn.example.com/s1-110.bin");
    }
}
