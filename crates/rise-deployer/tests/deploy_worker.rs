//! End-to-end deploy worker scenarios against in-memory backends.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use rise_core::messages::DeployJobData;
use rise_deployer::worker::DeployWorker;
use rise_deployer::{
    Deployment, DeploymentState, DeploymentStore, LimitsConfig, MemoryStore, Project,
    RecordingTracker, User,
};
use rise_deployer::{DeployError, TIMEOUT_ERROR_MESSAGE};
use rise_state::{LockBackend, MemoryBus, MemoryLockProvider};
use rise_store::{Acl, BucketConfig, RecordingTransfer};

const BUCKET: &str = "rise-deployments";
const OPTIMIZED_BUNDLE_KEY: &str = "deployments/a1b2c3-1/optimized-bundle.tar.gz";
const INDEX_HTML: &[u8] = b"<html><body>hi</body></html>";

struct Fixture {
    store: MemoryStore,
    locks: MemoryLockProvider,
    transfer: RecordingTransfer,
    bus: MemoryBus,
    tracker: RecordingTracker,
    worker: DeployWorker,
}

impl Fixture {
    fn new(transfer: RecordingTransfer) -> Self {
        let store = MemoryStore::new();
        let locks = MemoryLockProvider::new();
        let bus = MemoryBus::new();
        let tracker = RecordingTracker::new();

        let worker = DeployWorker::new(
            Arc::new(store.clone()),
            Arc::new(locks.clone()),
            Arc::new(transfer.clone()),
            Arc::new(bus.clone()),
            Arc::new(tracker.clone()),
            BucketConfig::default(),
            LimitsConfig::default(),
        );

        Self {
            store,
            locks,
            transfer,
            bus,
            tracker,
            worker,
        }
    }

    async fn seed(&self, watermark: bool) {
        self.store.insert_project(test_project(watermark)).await;
        self.store.insert_user(test_user()).await;
        self.store.seed_deployment(test_deployment()).await;
    }
}

fn test_project(watermark: bool) -> Project {
    Project {
        id: 1,
        name: "foo-bar-express".to_owned(),
        user_id: 1,
        watermark,
        force_https: false,
        basic_auth_username: None,
        encrypted_basic_auth_password: None,
        max_deploys_kept: 0,
        active_deployment_id: None,
    }
}

fn test_user() -> User {
    User {
        id: 1,
        email: "harry@rise.sh".to_owned(),
    }
}

fn test_deployment() -> Deployment {
    Deployment {
        id: 1,
        project_id: 1,
        user_id: 1,
        prefix: "a1b2c3".to_owned(),
        version: 1,
        state: DeploymentState::PendingDeploy,
        js_env_vars: "{}".to_owned(),
        raw_bundle_id: None,
        error_message: None,
        created_at: chrono::Utc::now(),
        deployed_at: None,
        deleted_at: None,
    }
}

/// Build a gzip-compressed tar with the given file entries.
fn bundle(entries: &[(&str, &[u8])]) -> Bytes {
    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder.append_data(&mut dir, "css/", &[] as &[u8]).unwrap();

        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        builder.finish().unwrap();
    }

    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&tar_bytes).unwrap();
    Bytes::from(gz.finish().unwrap())
}

fn site_bundle() -> Bytes {
    bundle(&[("index.html", INDEX_HTML), ("css/app.css", b"")])
}

fn job_payload(job: &DeployJobData) -> Vec<u8> {
    serde_json::to_vec(job).unwrap()
}

#[tokio::test]
async fn happy_path_publishes_webroot_metadata_and_invalidation() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.seed(false).await;
    fixture.transfer.put_object(OPTIMIZED_BUNDLE_KEY, site_bundle());

    fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap();

    let uploads = fixture.transfer.uploads();
    let keys: Vec<&str> = uploads.iter().map(|u| u.key.as_str()).collect();
    assert_eq!(
        keys,
        vec![
            "deployments/a1b2c3-1/webroot/index.html",
            "deployments/a1b2c3-1/webroot/css/app.css",
            "deployments/a1b2c3-1/webroot/jsenv.js",
            "domains/foo-bar-express.rise.cloud/meta.json",
        ]
    );
    assert!(uploads.iter().all(|u| u.acl == Acl::PublicRead));
    assert!(uploads.iter().all(|u| u.bucket == BUCKET));
    assert_eq!(uploads[0].content_type, "text/html");
    assert_eq!(uploads[0].body.as_ref(), INDEX_HTML);
    assert_eq!(uploads[1].content_type, "text/css");
    assert_eq!(uploads[2].content_type, "application/javascript");
    assert_eq!(uploads[3].content_type, "application/json");

    let events = fixture.bus.published().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].exchange, "edges");
    assert_eq!(events[0].routing_key, "v1.invalidation");
    assert_eq!(
        events[0].payload,
        br#"{"domains":["foo-bar-express.rise.cloud"]}"#
    );

    let deployment = fixture.store.deployment(1).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::Deployed);
    assert!(deployment.deployed_at.is_some());

    let project = fixture.store.project(1).await.unwrap();
    assert_eq!(project.active_deployment_id, Some(1));

    let tracked = fixture.tracker.events();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].event, "Project Deployed");
    assert_eq!(tracked[0].properties["projectName"], "foo-bar-express");
}

#[tokio::test]
async fn watermark_rewrites_html_but_not_css() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.seed(true).await;
    fixture.transfer.put_object(OPTIMIZED_BUNDLE_KEY, site_bundle());

    fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap();

    let html = fixture
        .transfer
        .uploaded("deployments/a1b2c3-1/webroot/index.html")
        .unwrap();
    assert_ne!(html.as_ref(), INDEX_HTML);
    let html_text = std::str::from_utf8(&html).unwrap();
    assert!(html_text.contains("rise-watermark"));
    assert!(html_text.ends_with("</body></html>"));

    let css = fixture
        .transfer
        .uploaded("deployments/a1b2c3-1/webroot/css/app.css")
        .unwrap();
    assert!(css.is_empty());
}

#[tokio::test]
async fn oversize_html_is_uploaded_verbatim() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.seed(true).await;

    let big = vec![b'a'; 6_000_000];
    fixture.transfer.put_object(
        OPTIMIZED_BUNDLE_KEY,
        bundle(&[("index.html", INDEX_HTML), ("big.html", &big)]),
    );

    fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap();

    let uploaded = fixture
        .transfer
        .uploaded("deployments/a1b2c3-1/webroot/big.html")
        .unwrap();
    assert_eq!(uploaded.len(), big.len());
    assert!(!std::str::from_utf8(&uploaded).unwrap().contains("rise-watermark"));
}

#[tokio::test]
async fn forbidden_file_name_is_skipped() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.seed(false).await;
    fixture.transfer.put_object(
        OPTIMIZED_BUNDLE_KEY,
        bundle(&[
            ("index.html", INDEX_HTML),
            ("weird file!.html", b"<html></html>"),
        ]),
    );

    fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap();

    let keys: Vec<String> = fixture
        .transfer
        .uploads()
        .into_iter()
        .map(|u| u.key)
        .collect();
    assert!(keys.iter().any(|k| k.ends_with("/index.html")));
    assert!(!keys.iter().any(|k| k.contains("weird")));

    let deployment = fixture.store.deployment(1).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::Deployed);
}

#[tokio::test]
async fn concurrent_jobs_on_one_project_serialise() {
    let store = MemoryStore::new();
    let locks = MemoryLockProvider::new();
    let bus = MemoryBus::new();
    let tracker = RecordingTracker::new();

    store.insert_project(test_project(false)).await;
    store.insert_user(test_user()).await;
    store.seed_deployment(test_deployment()).await;

    let make_worker = |transfer: &RecordingTransfer| {
        DeployWorker::new(
            Arc::new(store.clone()),
            Arc::new(locks.clone()),
            Arc::new(transfer.clone()),
            Arc::new(bus.clone()),
            Arc::new(tracker.clone()),
            BucketConfig::default(),
            LimitsConfig::default(),
        )
    };

    // A small upload delay keeps the winner inside its critical section
    // while the loser tries the lock.
    let first_transfer = RecordingTransfer::new().with_upload_delay(Duration::from_millis(20));
    let second_transfer = RecordingTransfer::new().with_upload_delay(Duration::from_millis(20));
    first_transfer.put_object(OPTIMIZED_BUNDLE_KEY, site_bundle());
    second_transfer.put_object(OPTIMIZED_BUNDLE_KEY, site_bundle());

    let first = make_worker(&first_transfer);
    let second = make_worker(&second_transfer);

    let payload = job_payload(&DeployJobData::new(1));
    let (a, b) = tokio::join!(first.work(&payload), second.work(&payload));

    let locked = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(DeployError::ProjectLocked)))
        .count();
    assert_eq!(locked, 1, "exactly one job must lose the lock race");
    assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);

    // The loser performed no uploads.
    let loser_uploads = if a.is_err() {
        first_transfer.upload_count()
    } else {
        second_transfer.upload_count()
    };
    assert_eq!(loser_uploads, 0);

    let deployment = store.deployment(1).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::Deployed);
}

#[tokio::test]
async fn locked_project_fails_without_touching_state() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.seed(false).await;
    fixture.transfer.put_object(OPTIMIZED_BUNDLE_KEY, site_bundle());

    let _held = fixture
        .locks
        .try_acquire("project:1", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let err = fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ProjectLocked));
    assert!(err.is_redeliverable());
    assert_eq!(fixture.transfer.upload_count(), 0);

    let deployment = fixture.store.deployment(1).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::PendingDeploy);
}

#[tokio::test]
async fn timeout_marks_deploy_failed_and_releases_lock() {
    let transfer = RecordingTransfer::new().with_upload_delay(Duration::from_millis(30));
    let fixture = Fixture::new(transfer);
    fixture.seed(false).await;

    let entries: Vec<(String, Vec<u8>)> = (0..50)
        .map(|i| (format!("page{i}.html"), b"<html></html>".to_vec()))
        .collect();
    let refs: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(p, c)| (p.as_str(), c.as_slice()))
        .collect();
    fixture.transfer.put_object(OPTIMIZED_BUNDLE_KEY, bundle(&refs));

    let worker = DeployWorker::new(
        Arc::new(fixture.store.clone()),
        Arc::new(fixture.locks.clone()),
        Arc::new(fixture.transfer.clone()),
        Arc::new(fixture.bus.clone()),
        Arc::new(fixture.tracker.clone()),
        BucketConfig::default(),
        LimitsConfig::default(),
    )
    .with_upload_timeout(Duration::from_millis(50));

    let err = worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Timeout));
    assert!(!err.is_redeliverable());

    let deployment = fixture.store.deployment(1).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::DeployFailed);
    assert_eq!(deployment.error_message.as_deref(), Some(TIMEOUT_ERROR_MESSAGE));

    // No invalidation and no metadata after a timeout.
    assert!(fixture.bus.published().await.is_empty());
    assert!(!fixture
        .transfer
        .uploads()
        .iter()
        .any(|u| u.key.starts_with("domains/")));

    // The guard released on the way out; give the spawned release a tick.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(fixture
        .locks
        .try_acquire("project:1", Duration::from_secs(60))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn upload_error_leaves_state_untouched_for_redelivery() {
    let transfer = RecordingTransfer::new().with_upload_error("connection reset");
    let fixture = Fixture::new(transfer);
    fixture.seed(false).await;
    fixture.transfer.put_object(OPTIMIZED_BUNDLE_KEY, site_bundle());

    let err = fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Transfer(_)));
    assert!(err.is_redeliverable());

    let deployment = fixture.store.deployment(1).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::PendingDeploy);
    assert!(fixture.bus.published().await.is_empty());
}

#[tokio::test]
async fn corrupt_bundle_fails_the_job() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.seed(false).await;
    fixture
        .transfer
        .put_object(OPTIMIZED_BUNDLE_KEY, Bytes::from_static(b"not a gzip stream"));

    let err = fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Archive(_)));

    let deployment = fixture.store.deployment(1).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::PendingDeploy);
}

#[tokio::test]
async fn rejects_unprepared_states() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.seed(false).await;

    for state in [DeploymentState::Uploaded, DeploymentState::PendingUpload] {
        let mut deployment = test_deployment();
        deployment.state = state;
        fixture.store.seed_deployment(deployment).await;

        let err = fixture
            .worker
            .work(&job_payload(&DeployJobData::new(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::UnexpectedState(_)));
    }

    assert_eq!(fixture.transfer.upload_count(), 0);
}

#[tokio::test]
async fn retry_job_recovers_failed_deployment() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.store.insert_project(test_project(false)).await;
    fixture.store.insert_user(test_user()).await;

    let mut deployment = test_deployment();
    deployment.state = DeploymentState::DeployFailed;
    deployment.error_message = Some(TIMEOUT_ERROR_MESSAGE.to_owned());
    fixture.store.seed_deployment(deployment).await;
    fixture.transfer.put_object(OPTIMIZED_BUNDLE_KEY, site_bundle());

    fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap();

    let stored = fixture.store.deployment(1).await.unwrap();
    assert_eq!(stored.state, DeploymentState::Deployed);
    assert!(stored.error_message.is_none());
    assert!(stored.deployed_at.is_some());

    // The retry republishes the full webroot and invalidates as usual.
    assert!(fixture
        .transfer
        .uploads()
        .iter()
        .any(|u| u.key == "deployments/a1b2c3-1/webroot/index.html"));
    assert_eq!(fixture.bus.published().await.len(), 1);

    let project = fixture.store.project(1).await.unwrap();
    assert_eq!(project.active_deployment_id, Some(1));
}

#[tokio::test]
async fn rejects_redeploy_of_deployed_deployment() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.seed(false).await;

    let mut deployment = test_deployment();
    deployment.state = DeploymentState::Deployed;
    deployment.deployed_at = Some(chrono::Utc::now());
    fixture.store.seed_deployment(deployment).await;

    let err = fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeployError::UnexpectedState(DeploymentState::Deployed)
    ));
}

#[tokio::test]
async fn metadata_only_republish_of_deployed_deployment() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.seed(false).await;

    let mut deployment = test_deployment();
    deployment.state = DeploymentState::Deployed;
    deployment.deployed_at = Some(chrono::Utc::now());
    fixture.store.seed_deployment(deployment).await;

    let job = DeployJobData {
        deployment_id: 1,
        skip_webroot_upload: true,
        use_raw_bundle: false,
        skip_invalidation: false,
    };

    fixture.worker.work(&job_payload(&job)).await.unwrap();

    // Metadata and invalidation only; the webroot is untouched.
    let keys: Vec<String> = fixture
        .transfer
        .uploads()
        .into_iter()
        .map(|u| u.key)
        .collect();
    assert_eq!(keys, vec!["domains/foo-bar-express.rise.cloud/meta.json"]);
    assert_eq!(fixture.bus.published().await.len(), 1);

    let stored = fixture.store.deployment(1).await.unwrap();
    assert_eq!(stored.state, DeploymentState::Deployed);
}

#[tokio::test]
async fn metadata_is_identical_across_domains() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.seed(false).await;
    fixture.store.add_domain(1, "www.example.com").await;
    fixture.transfer.put_object(OPTIMIZED_BUNDLE_KEY, site_bundle());

    fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap();

    let metas: Vec<Bytes> = fixture
        .transfer
        .uploads()
        .into_iter()
        .filter(|u| u.key.starts_with("domains/"))
        .map(|u| u.body)
        .collect();
    assert_eq!(metas.len(), 2);
    assert_eq!(metas[0], metas[1]);
    assert_eq!(metas[0].as_ref(), br#"{"prefix":"a1b2c3-1"}"#);

    let events = fixture.bus.published().await;
    assert_eq!(events.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&events[0].payload).unwrap();
    assert_eq!(
        body["domains"],
        serde_json::json!(["foo-bar-express.rise.cloud", "www.example.com"])
    );
}

#[tokio::test]
async fn jsenv_file_embeds_env_vars_verbatim() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.store.insert_project(test_project(false)).await;
    fixture.store.insert_user(test_user()).await;

    let mut deployment = test_deployment();
    deployment.js_env_vars = r#"{"API_URL":"https://api.rise.sh","STAGE":"prod"}"#.to_owned();
    fixture.store.seed_deployment(deployment).await;
    fixture.transfer.put_object(OPTIMIZED_BUNDLE_KEY, site_bundle());

    fixture
        .worker
        .work(&job_payload(&DeployJobData::new(1)))
        .await
        .unwrap();

    let jsenv = fixture
        .transfer
        .uploaded("deployments/a1b2c3-1/webroot/jsenv.js")
        .unwrap();
    let expected = format!(
        "(function(global, env) {{\n  if (typeof module === \"object\" && typeof module.exports === \"object\") {{\n    module.exports = env;\n  }} else {{\n    global.JSENV = env;\n  }}\n}}(this, {}));\n",
        r#"{"API_URL":"https://api.rise.sh","STAGE":"prod"}"#
    );
    assert_eq!(jsenv.as_ref(), expected.as_bytes());
}

#[tokio::test]
async fn raw_bundle_job_downloads_recorded_bundle_path() {
    let fixture = Fixture::new(RecordingTransfer::new());
    fixture.store.insert_project(test_project(false)).await;
    fixture.store.insert_user(test_user()).await;

    let bundle_path = "deployments/a1b2c3-1/raw-bundle.tar.gz";
    let raw = fixture
        .store
        .insert_raw_bundle(1, bundle_path)
        .await
        .unwrap();

    let mut deployment = test_deployment();
    deployment.raw_bundle_id = Some(raw.id);
    fixture.store.seed_deployment(deployment).await;
    fixture.transfer.put_object(bundle_path, site_bundle());

    let job = DeployJobData {
        deployment_id: 1,
        skip_webroot_upload: false,
        use_raw_bundle: true,
        skip_invalidation: false,
    };
    fixture.worker.work(&job_payload(&job)).await.unwrap();

    assert_eq!(fixture.transfer.downloads(), vec![bundle_path.to_owned()]);

    let deployment = fixture.store.deployment(1).await.unwrap();
    assert_eq!(deployment.state, DeploymentState::Deployed);
}

#[tokio::test]
async fn missing_deployment_is_terminal() {
    let fixture = Fixture::new(RecordingTransfer::new());

    let err = fixture
        .worker
        .work(&job_payload(&DeployJobData::new(999)))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::DeploymentNotFound(999)));
    assert!(!err.is_redeliverable());
}
