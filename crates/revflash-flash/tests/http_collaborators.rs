//! HTTP job tracker, catalog and package download against a local server

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use revflash_core::{
    CollaboratorError, FlashStatus, JobTracker, JobUpdate, PackageCatalog, TunePackage,
    VersionSelector,
};
use revflash_flash::config::TimeoutsConfig;
use revflash_flash::testing::{TestServer, TestSigner};
use revflash_flash::{
    FlashConfig, FlashError, FlashOrchestrator, FlashRequest, HttpCatalog, HttpJobTracker,
    PackageStore, RemoteConfig,
};
use revflash_obd::{ClientConfig, SimulatorAdapter, SimulatorConfig, VehicleClient};
use serde_json::{json, Value};

// =============================================================================
// Fake backend
// =============================================================================

#[derive(Clone, Default)]
struct Backend {
    creates: Arc<Mutex<Vec<(Value, Option<String>)>>>,
    patches: Arc<Mutex<Vec<(String, Value)>>>,
    package: Arc<Mutex<Option<TunePackage>>>,
    image: Arc<Mutex<Vec<u8>>>,
    fail_updates: Arc<Mutex<bool>>,
}

async fn create_job(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let key = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut creates = backend.creates.lock();
    creates.push((body, key));
    (StatusCode::CREATED, Json(json!({ "id": 16 + creates.len() })))
}

async fn update_job(
    State(backend): State<Backend>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    if *backend.fail_updates.lock() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    backend.patches.lock().push((id, body));
    StatusCode::OK
}

async fn resolve_version(
    State(backend): State<Backend>,
    Path((tune, version)): Path<(String, String)>,
) -> Result<Json<TunePackage>, StatusCode> {
    let package = backend.package.lock().clone().ok_or(StatusCode::NOT_FOUND)?;
    if tune != "stage-1" || (version != "latest" && version != package.version_label) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(package))
}

async fn download(State(backend): State<Backend>) -> Vec<u8> {
    backend.image.lock().clone()
}

async fn start(backend: Backend) -> TestServer {
    let router = Router::new()
        .route("/api/v1/garage/flash-jobs/", post(create_job))
        .route("/api/v1/garage/flash-jobs/{id}/", patch(update_job))
        .route(
            "/api/v1/marketplace/tunes/{tune}/versions/{version}/",
            get(resolve_version),
        )
        .route("/files/stage-1.bin", get(download))
        .with_state(backend);
    TestServer::start(router).await.unwrap()
}

fn remote(server: &TestServer) -> RemoteConfig {
    RemoteConfig {
        api_key: Some("garage-secret".into()),
        ..RemoteConfig::new(format!("{}/api/v1", server.base_url()))
    }
}

fn signed_remote_package(signer: &TestSigner, server: &TestServer, image: &[u8]) -> TunePackage {
    let hash = revflash_flash::PackageVerifier::hash_bytes(image);
    TunePackage {
        id: "stage-1-v3".into(),
        version_label: "3.0.0".into(),
        download_url: format!("{}/files/stage-1.bin", server.base_url()),
        signature: signer.sign_hash(&hash),
        expected_hash: hash,
        public_key_id: signer.key_id().to_string(),
    }
}

// =============================================================================
// Job tracker
// =============================================================================

#[tokio::test]
async fn test_tracker_create_and_update() {
    let backend = Backend::default();
    let server = start(backend.clone()).await;
    let tracker = HttpJobTracker::new(&remote(&server), &TimeoutsConfig::default()).unwrap();

    let id = tracker.create_job("veh-1", "stage-1").await.unwrap();
    assert_eq!(id, "17");

    tracker
        .update_job(
            &id,
            &JobUpdate {
                status: FlashStatus::Writing,
                progress: 75,
                logs: vec!["Writing".into()],
            },
        )
        .await
        .unwrap();

    let creates = backend.creates.lock().clone();
    assert_eq!(creates[0].0, json!({ "vehicle_id": "veh-1", "tune_id": "stage-1" }));
    assert_eq!(creates[0].1.as_deref(), Some("garage-secret"));

    let patches = backend.patches.lock().clone();
    assert_eq!(patches[0].0, "17");
    assert_eq!(
        patches[0].1,
        json!({ "status": "FLASHING", "stage": "writing", "progress": 75, "logs": ["Writing"] })
    );
}

#[tokio::test]
async fn test_tracker_server_error_is_reported() {
    let backend = Backend::default();
    *backend.fail_updates.lock() = true;
    let server = start(backend).await;
    let tracker = HttpJobTracker::new(&remote(&server), &TimeoutsConfig::default()).unwrap();

    let err = tracker
        .update_job(
            "17",
            &JobUpdate {
                status: FlashStatus::Completed,
                progress: 100,
                logs: vec![],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CollaboratorError::Remote { status: 500, .. }));
}

#[tokio::test]
async fn test_tracker_unreachable() {
    let tracker = HttpJobTracker::new(
        &RemoteConfig::new("http://127.0.0.1:9"),
        &TimeoutsConfig::default(),
    )
    .unwrap();
    let err = tracker.create_job("veh-1", "stage-1").await.unwrap_err();
    assert!(matches!(err, CollaboratorError::Unreachable(_)));
}

// =============================================================================
// Catalog and download
// =============================================================================

#[tokio::test]
async fn test_catalog_resolves_and_reports_missing_versions() {
    let backend = Backend::default();
    let server = start(backend.clone()).await;
    let signer = TestSigner::new("rev_key_v1", 5);
    *backend.package.lock() = Some(signed_remote_package(&signer, &server, b"image"));
    let catalog = HttpCatalog::new(&remote(&server), &TimeoutsConfig::default()).unwrap();

    let latest = catalog
        .resolve("stage-1", &VersionSelector::Latest)
        .await
        .unwrap();
    assert_eq!(latest.version_label, "3.0.0");

    let exact = catalog
        .resolve("stage-1", &VersionSelector::Exact("3.0.0".into()))
        .await
        .unwrap();
    assert_eq!(exact.id, "stage-1-v3");

    let err = catalog
        .resolve("stage-1", &VersionSelector::Exact("1.0.0".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, CollaboratorError::NotFound(_)));
}

#[tokio::test]
async fn test_package_download_over_http() {
    let backend = Backend::default();
    *backend.image.lock() = b"remote tune bytes".to_vec();
    let server = start(backend).await;
    let dir = tempfile::tempdir().unwrap();
    let store = PackageStore::from_config(&FlashConfig::builder(dir.path()).build()).unwrap();
    let signer = TestSigner::new("rev_key_v1", 5);

    let package = signed_remote_package(&signer, &server, b"remote tune bytes");
    let path = store.download(&package).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"remote tune bytes");

    let missing = TunePackage {
        download_url: format!("{}/files/missing.bin", server.base_url()),
        ..package
    };
    let err = store.download(&missing).await.unwrap_err();
    assert!(matches!(err, FlashError::DownloadFailed(ref m) if m.contains("404")));
}

// =============================================================================
// Whole pipeline over HTTP
// =============================================================================

#[tokio::test]
async fn test_flash_with_remote_collaborators() {
    let backend = Backend::default();
    let server = start(backend.clone()).await;
    let signer = TestSigner::new("rev_key_v2", 11);
    let image: Vec<u8> = (0..512u32).map(|i| (i % 199) as u8).collect();
    *backend.image.lock() = image.clone();
    *backend.package.lock() = Some(signed_remote_package(&signer, &server, &image));

    let dir = tempfile::tempdir().unwrap();
    let mut config = FlashConfig::builder(dir.path())
        .tracker(format!("{}/api/v1", server.base_url()))
        .catalog(format!("{}/api/v1", server.base_url()))
        .api_key("garage-secret")
        .trusted_key("rev_key_v1", TestSigner::new("rev_key_v1", 1).public_key_b64())
        .trusted_key(signer.key_id(), signer.public_key_b64())
        .build();
    config.transfer.block_size = 64;

    let sim = Arc::new(SimulatorAdapter::new(&SimulatorConfig::instant()));
    let client = Arc::new(VehicleClient::new(sim.clone(), ClientConfig::default()));
    client.connect().await.unwrap();

    let catalog = HttpCatalog::new(config.catalog.as_ref().unwrap(), &config.timeouts).unwrap();
    let orchestrator = FlashOrchestrator::from_config(client, &config, Arc::new(catalog)).unwrap();

    let job = orchestrator
        .run(FlashRequest::exact("veh-7", "stage-1", "3.0.0"))
        .await
        .unwrap();

    assert_eq!(job.status, FlashStatus::Completed);
    assert_eq!(job.remote_id.as_deref(), Some("17"));
    assert_eq!(&sim.memory()[..512], image.as_slice());

    let patches = backend.patches.lock().clone();
    assert_eq!(patches.len(), 8);
    assert!(patches.iter().all(|(id, _)| id == "17"));
    assert_eq!(patches.last().unwrap().1["status"], "COMPLETED");
    let reported_lines: usize = patches
        .iter()
        .map(|(_, body)| body["logs"].as_array().unwrap().len())
        .sum();
    assert_eq!(reported_lines, job.log.len());
}
