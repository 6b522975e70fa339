//! Package integrity verification
//!
//! A package is trusted only when the SHA-256 of its bytes equals the hash
//! advertised by the catalog *and* the catalog's Ed25519 signature over the
//! raw hash bytes checks out against a trusted key.

use std::collections::HashMap;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use revflash_core::TunePackage;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::TrustConfig;
use crate::error::VerifyError;

const SIGNATURE_LEN: usize = 64;

/// Hash and signature checks against a set of trusted keys
///
/// Holds no job state; results are returned to the caller.
#[derive(Debug, Clone, Default)]
pub struct PackageVerifier {
    keys: HashMap<String, VerifyingKey>,
}

impl PackageVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a verifier trusting every key in `trust`
    pub fn from_config(trust: &TrustConfig) -> Result<Self, VerifyError> {
        let mut verifier = Self::new();
        for key in &trust.keys {
            verifier.add_key_b64(&key.key_id, &key.public_key_b64)?;
        }
        info!(keys = verifier.keys.len(), "Package verifier ready");
        Ok(verifier)
    }

    pub fn add_key(&mut self, key_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(key_id.into(), key);
    }

    /// Trust a raw 32-byte Ed25519 public key given as base64
    pub fn add_key_b64(&mut self, key_id: &str, public_key_b64: &str) -> Result<(), VerifyError> {
        let invalid = |reason: String| VerifyError::InvalidKey {
            key_id: key_id.to_string(),
            reason,
        };

        let raw = STANDARD
            .decode(public_key_b64.trim())
            .map_err(|e| invalid(e.to_string()))?;
        let raw: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| invalid(format!("expected 32 bytes, got {}", raw.len())))?;
        let key = VerifyingKey::from_bytes(&raw).map_err(|e| invalid(e.to_string()))?;

        self.add_key(key_id, key);
        Ok(())
    }

    pub fn trusts(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    /// Lowercase hex SHA-256 of `data`
    pub fn hash_bytes(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Lowercase hex SHA-256 of the file at `path`
    pub async fn hash_file(path: &Path) -> Result<String, VerifyError> {
        let data = tokio::fs::read(path).await?;
        Ok(Self::hash_bytes(&data))
    }

    /// Check a base64 signature over the raw bytes of `hash_hex`
    pub fn verify_signature(
        &self,
        key_id: &str,
        hash_hex: &str,
        signature_b64: &str,
    ) -> Result<(), VerifyError> {
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| VerifyError::UnknownKey(key_id.to_string()))?;

        let raw = STANDARD
            .decode(signature_b64.trim())
            .map_err(|e| VerifyError::SignatureInvalid(format!("not base64: {}", e)))?;
        let raw: [u8; SIGNATURE_LEN] = raw.as_slice().try_into().map_err(|_| {
            VerifyError::SignatureInvalid(format!(
                "expected {} bytes, got {}",
                SIGNATURE_LEN,
                raw.len()
            ))
        })?;
        let signature = Signature::from_bytes(&raw);

        let message = hex::decode(hash_hex.trim())
            .map_err(|e| VerifyError::SignatureInvalid(format!("hash is not hex: {}", e)))?;

        key.verify(&message, &signature).map_err(|_| {
            VerifyError::SignatureInvalid(format!("signature does not match key {}", key_id))
        })
    }

    /// Verify a downloaded package file and return its bytes
    ///
    /// The hash is checked before the signature; both must pass.
    pub async fn verify_file(
        &self,
        path: &Path,
        package: &TunePackage,
    ) -> Result<Vec<u8>, VerifyError> {
        let data = tokio::fs::read(path).await?;
        let actual = Self::hash_bytes(&data);

        if !actual.eq_ignore_ascii_case(package.expected_hash.trim()) {
            warn!(package = %package.id, expected = %package.expected_hash, actual = %actual, "Hash mismatch");
            return Err(VerifyError::HashMismatch {
                expected: package.expected_hash.clone(),
                actual,
            });
        }
        debug!(package = %package.id, hash = %actual, "Hash matches");

        self.verify_signature(&package.public_key_id, &actual, &package.signature)?;
        info!(package = %package.id, key = %package.public_key_id, "Package signature verified");

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn verifier_with(key_id: &str, key: &SigningKey) -> PackageVerifier {
        let mut verifier = PackageVerifier::new();
        verifier.add_key(key_id, key.verifying_key());
        verifier
    }

    fn sign_hash(key: &SigningKey, hash_hex: &str) -> String {
        let signature = key.sign(&hex::decode(hash_hex).unwrap());
        STANDARD.encode(signature.to_bytes())
    }

    #[test]
    fn test_hash_bytes_known_value() {
        assert_eq!(
            PackageVerifier::hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_valid_signature() {
        let key = signing_key(7);
        let verifier = verifier_with("rev_key_v1", &key);
        let hash = PackageVerifier::hash_bytes(b"tune image");
        let sig = sign_hash(&key, &hash);

        verifier.verify_signature("rev_key_v1", &hash, &sig).unwrap();
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let verifier = verifier_with("rev_key_v1", &signing_key(7));
        let hash = PackageVerifier::hash_bytes(b"tune image");
        let sig = sign_hash(&signing_key(8), &hash);

        let err = verifier.verify_signature("rev_key_v1", &hash, &sig).unwrap_err();
        assert!(matches!(err, VerifyError::SignatureInvalid(_)));
    }

    #[test]
    fn test_signature_over_other_hash_rejected() {
        let key = signing_key(7);
        let verifier = verifier_with("rev_key_v1", &key);
        let sig = sign_hash(&key, &PackageVerifier::hash_bytes(b"original"));
        let hash = PackageVerifier::hash_bytes(b"tampered");

        assert!(verifier.verify_signature("rev_key_v1", &hash, &sig).is_err());
    }

    #[test]
    fn test_unknown_key_id() {
        let verifier = verifier_with("rev_key_v1", &signing_key(7));
        let hash = PackageVerifier::hash_bytes(b"x");
        let sig = sign_hash(&signing_key(7), &hash);

        let err = verifier.verify_signature("rev_key_v9", &hash, &sig).unwrap_err();
        assert!(matches!(err, VerifyError::UnknownKey(id) if id == "rev_key_v9"));
    }

    #[test]
    fn test_short_signature_rejected() {
        let verifier = verifier_with("k", &signing_key(7));
        let hash = PackageVerifier::hash_bytes(b"x");
        let short = STANDARD.encode([0u8; 63]);

        let err = verifier.verify_signature("k", &hash, &short).unwrap_err();
        assert!(err.to_string().contains("expected 64 bytes"));
    }

    #[test]
    fn test_garbage_base64_rejected() {
        let verifier = verifier_with("k", &signing_key(7));
        let err = verifier
            .verify_signature("k", "00", "not*base64")
            .unwrap_err();
        assert!(matches!(err, VerifyError::SignatureInvalid(_)));
    }

    #[test]
    fn test_rotated_keys_both_trusted() {
        let old = signing_key(1);
        let new = signing_key(2);
        let trust = TrustConfig {
            keys: vec![
                crate::config::TrustedKey {
                    key_id: "rev_key_v1".into(),
                    public_key_b64: STANDARD.encode(old.verifying_key().to_bytes()),
                },
                crate::config::TrustedKey {
                    key_id: "rev_key_v2".into(),
                    public_key_b64: STANDARD.encode(new.verifying_key().to_bytes()),
                },
            ],
        };
        let verifier = PackageVerifier::from_config(&trust).unwrap();
        let hash = PackageVerifier::hash_bytes(b"image");

        verifier
            .verify_signature("rev_key_v1", &hash, &sign_hash(&old, &hash))
            .unwrap();
        verifier
            .verify_signature("rev_key_v2", &hash, &sign_hash(&new, &hash))
            .unwrap();
        assert!(verifier
            .verify_signature("rev_key_v2", &hash, &sign_hash(&old, &hash))
            .is_err());
    }

    #[test]
    fn test_wrong_length_trusted_key() {
        let mut verifier = PackageVerifier::new();
        let err = verifier
            .add_key_b64("short", &STANDARD.encode([1u8; 16]))
            .unwrap_err();
        assert!(matches!(err, VerifyError::InvalidKey { ref key_id, .. } if key_id == "short"));
    }

    #[tokio::test]
    async fn test_verify_file_checks_hash_first() {
        let key = signing_key(3);
        let verifier = verifier_with("k", &key);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune.bin");
        tokio::fs::write(&path, b"image bytes").await.unwrap();

        let hash = PackageVerifier::hash_bytes(b"image bytes");
        let mut package = TunePackage {
            id: "pkg-1".into(),
            version_label: "1.0.0".into(),
            download_url: path.display().to_string(),
            expected_hash: hash.to_uppercase(),
            signature: sign_hash(&key, &hash),
            public_key_id: "k".into(),
        };

        let data = verifier.verify_file(&path, &package).await.unwrap();
        assert_eq!(data, b"image bytes");

        package.expected_hash = PackageVerifier::hash_bytes(b"other");
        package.public_key_id = "missing".into();
        let err = verifier.verify_file(&path, &package).await.unwrap_err();
        assert!(matches!(err, VerifyError::HashMismatch { .. }));
    }
}
