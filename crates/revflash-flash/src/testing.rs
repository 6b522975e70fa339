//! Test utilities for revflash-flash
//!
//! In-memory collaborators, a package signer and a small HTTP server for
//! exercising the remote clients.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use revflash_core::{
    CollaboratorError, CollaboratorResult, JobTracker, JobUpdate, SafetyGate, SafetyVerdict,
    TunePackage,
};
use tokio::net::TcpListener;

use crate::config::{TrustConfig, TrustedKey};
use crate::verifier::PackageVerifier;

/// Job tracker that records every call
#[derive(Debug, Default)]
pub struct RecordingJobTracker {
    created: Mutex<Vec<(String, String)>>,
    updates: Mutex<Vec<(String, JobUpdate)>>,
    unreachable: bool,
}

impl RecordingJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker whose every call fails as if the server were down
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// `(vehicle_id, tune_id)` of every created job
    pub fn created(&self) -> Vec<(String, String)> {
        self.created.lock().clone()
    }

    /// `(remote job id, update)` in arrival order
    pub fn updates(&self) -> Vec<(String, JobUpdate)> {
        self.updates.lock().clone()
    }

    /// Progress values of all updates
    pub fn progress(&self) -> Vec<u8> {
        self.updates.lock().iter().map(|(_, u)| u.progress).collect()
    }
}

#[async_trait]
impl JobTracker for RecordingJobTracker {
    async fn create_job(&self, vehicle_id: &str, tune_id: &str) -> CollaboratorResult<String> {
        if self.unreachable {
            return Err(CollaboratorError::Unreachable("tracker offline".into()));
        }
        let mut created = self.created.lock();
        created.push((vehicle_id.to_string(), tune_id.to_string()));
        Ok(format!("remote-{}", created.len()))
    }

    async fn update_job(&self, job_id: &str, update: &JobUpdate) -> CollaboratorResult<()> {
        if self.unreachable {
            return Err(CollaboratorError::Unreachable("tracker offline".into()));
        }
        self.updates.lock().push((job_id.to_string(), update.clone()));
        Ok(())
    }
}

/// Safety gate with a fixed answer
#[derive(Debug, Clone)]
pub struct FixedSafetyGate {
    verdict: Option<SafetyVerdict>,
}

impl FixedSafetyGate {
    pub fn rejecting(risk_score: f64, reason: impl Into<String>) -> Self {
        Self {
            verdict: Some(SafetyVerdict {
                passed: false,
                risk_score,
                reasons: vec![reason.into()],
            }),
        }
    }

    /// A gate that cannot be reached
    pub fn unreachable() -> Self {
        Self { verdict: None }
    }
}

#[async_trait]
impl SafetyGate for FixedSafetyGate {
    async fn evaluate(&self, _tune_id: &str, _vehicle_id: &str) -> CollaboratorResult<SafetyVerdict> {
        self.verdict
            .clone()
            .ok_or_else(|| CollaboratorError::Unreachable("safety service offline".into()))
    }
}

/// Deterministic package signer
pub struct TestSigner {
    key_id: String,
    key: SigningKey,
}

impl TestSigner {
    pub fn new(key_id: impl Into<String>, seed: u8) -> Self {
        Self {
            key_id: key_id.into(),
            key: SigningKey::from_bytes(&[seed; 32]),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.key.verifying_key().to_bytes())
    }

    pub fn trusted_key(&self) -> TrustedKey {
        TrustedKey {
            key_id: self.key_id.clone(),
            public_key_b64: self.public_key_b64(),
        }
    }

    /// Verifier trusting only this signer
    pub fn verifier(&self) -> PackageVerifier {
        let trust = TrustConfig {
            keys: vec![self.trusted_key()],
        };
        // the key comes from a valid signing key
        PackageVerifier::from_config(&trust).unwrap_or_default()
    }

    /// Base64 signature over the raw bytes of `hash_hex`
    pub fn sign_hash(&self, hash_hex: &str) -> String {
        let message = hex::decode(hash_hex).unwrap_or_default();
        STANDARD.encode(self.key.sign(&message).to_bytes())
    }

    /// Write `image` under `dir` and describe it as a signed package
    pub fn package(
        &self,
        dir: &Path,
        id: &str,
        version: &str,
        image: &[u8],
    ) -> std::io::Result<TunePackage> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}-{}.bin", id, version));
        std::fs::write(&path, image)?;

        let hash = PackageVerifier::hash_bytes(image);
        Ok(TunePackage {
            id: id.to_string(),
            version_label: version.to_string(),
            download_url: path.display().to_string(),
            signature: self.sign_hash(&hash),
            expected_hash: hash,
            public_key_id: self.key_id.clone(),
        })
    }
}

/// An HTTP server that shuts down when dropped
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Serve `router` on an ephemeral local port
    pub async fn start(router: axum::Router) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // Give server a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
