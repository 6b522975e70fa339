//! Tune package descriptors

use serde::{Deserialize, Serialize};

/// Descriptor of a downloadable tune package, as returned by the catalog.
///
/// Immutable once resolved; local progress is tracked with [`PackageStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunePackage {
    /// Package (tune version) identifier
    pub id: String,
    /// Human-readable version label, e.g. "1.4.0"
    pub version_label: String,
    /// Where the package bytes can be fetched from (`http(s)://`, `file://` or a path)
    pub download_url: String,
    /// Lowercase hex SHA-256 of the package bytes
    #[serde(alias = "tune_hash_sha256")]
    pub expected_hash: String,
    /// Base64 Ed25519 signature over the raw hash bytes
    #[serde(alias = "signature_b64")]
    pub signature: String,
    /// Identifier of the trusted key that produced `signature`
    #[serde(alias = "signing_key_id")]
    pub public_key_id: String,
}

/// Local annotation of a package's progress through download and verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    Resolved,
    Downloaded,
    Verified,
    Rejected,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Resolved => "resolved",
            PackageStatus::Downloaded => "downloaded",
            PackageStatus::Verified => "verified",
            PackageStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which version of a tune to resolve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionSelector {
    /// Exactly this version label; the catalog must not substitute another
    Exact(String),
    /// Whatever the catalog considers current
    Latest,
}

impl VersionSelector {
    /// Path segment used by remote catalogs
    pub fn as_path_segment(&self) -> &str {
        match self {
            VersionSelector::Exact(label) => label,
            VersionSelector::Latest => "latest",
        }
    }

    /// Whether `package` satisfies this selector
    pub fn accepts(&self, package: &TunePackage) -> bool {
        match self {
            VersionSelector::Exact(label) => &package.version_label == label,
            VersionSelector::Latest => true,
        }
    }
}

impl std::fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_path_segment())
    }
}
