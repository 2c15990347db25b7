//! Integration tests for the deployment lifecycle

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use pagegate::archive::ArchiveError;
use pagegate::clock::{Clock, ManualClock};
use pagegate::config::{AppConfig, AppDeploymentsConfig, AppSiteConfig, DeploymentLimits, SiteConfig};
use pagegate::db::Database;
use pagegate::lifecycle::{recompute_expiry, DeploymentLifecycle};
use pagegate::models::{App, Deployment, DeploymentStatus, FileEntry};
use pagegate::storage::{MemoryStorage, ObjectStorage};
use pagegate::Error;
use tokio::io::AsyncWriteExt;

const TTL_SECS: u64 = 3600;

const SITE_FILES: &[(&str, &[u8])] = &[
    ("index.html", b"<h1>hello</h1>"),
    ("assets/app.js", b"console.log('hi')"),
];

struct Harness {
    lifecycle: DeploymentLifecycle,
    clock: Arc<ManualClock>,
    storage: Arc<MemoryStorage>,
}

fn app_config() -> AppConfig {
    AppConfig {
        sites: vec![
            AppSiteConfig {
                name: "main".to_string(),
                access: Vec::new(),
            },
            AppSiteConfig {
                name: "staging".to_string(),
                access: Vec::new(),
            },
        ],
        deployments: AppDeploymentsConfig { ttl_secs: TTL_SECS },
        ..AppConfig::default()
    }
}

fn harness() -> Harness {
    let db = Database::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let storage = Arc::new(MemoryStorage::new());

    db.transaction(|tx| tx.create_app(&App::new(clock.now(), "blog", app_config())))
        .unwrap();

    let lifecycle = DeploymentLifecycle::new(
        db,
        storage.clone(),
        clock.clone(),
        DeploymentLimits::default(),
        "sites/",
    );
    Harness {
        lifecycle,
        clock,
        storage,
    }
}

fn manifest(files: &[(&str, &[u8])]) -> Vec<FileEntry> {
    files
        .iter()
        .map(|(path, data)| FileEntry {
            path: path.to_string(),
            size: data.len() as u64,
        })
        .collect()
}

/// Build a tar archive from `(path, content)` pairs.
///
/// Names are written verbatim into the header, so unsafe paths survive.
fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_old();
        header.as_old_mut().name[..path.len()].copy_from_slice(path.as_bytes());
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

async fn deploy(h: &Harness, name: &str) -> Deployment {
    h.lifecycle
        .create_deployment("blog", name, manifest(SITE_FILES), SiteConfig::default())
        .unwrap();
    h.lifecycle
        .upload_deployment("blog", name, Cursor::new(tarball(SITE_FILES)))
        .await
        .unwrap()
}

fn expire_at(h: &Harness, name: &str) -> Option<chrono::DateTime<Utc>> {
    h.lifecycle.get_deployment("blog", name).unwrap().deployment.expire_at
}

fn ttl() -> Duration {
    Duration::seconds(TTL_SECS as i64)
}

// ============================================================================
// Create and upload
// ============================================================================

#[tokio::test]
async fn test_upload_stores_files_under_deployment_prefix() {
    let h = harness();
    let deployment = deploy(&h, "v1").await;

    assert!(deployment.is_uploaded());
    assert!(deployment.storage_key_prefix.starts_with("sites/blog/"));

    let mut keys = h.storage.keys();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            format!("{}assets/app.js", deployment.storage_key_prefix),
            format!("{}index.html", deployment.storage_key_prefix),
        ]
    );

    let status = deployment.status(h.clock.now(), false);
    assert_eq!(status, DeploymentStatus::Inactive);
    assert_eq!(deployment.expire_at, None);
}

#[tokio::test]
async fn test_each_deployment_gets_its_own_prefix() {
    let h = harness();
    let v1 = deploy(&h, "v1").await;
    let v2 = deploy(&h, "v2").await;

    assert_ne!(v1.storage_key_prefix, v2.storage_key_prefix);
    assert_eq!(h.storage.len(), 4);
}

#[tokio::test]
async fn test_duplicate_deployment_name_rejected() {
    let h = harness();
    deploy(&h, "v1").await;

    let err = h
        .lifecycle
        .create_deployment("blog", "v1", manifest(SITE_FILES), SiteConfig::default())
        .unwrap_err();
    assert!(matches!(err, Error::UsedName));
}

#[tokio::test]
async fn test_create_deployment_for_missing_app() {
    let h = harness();
    let err = h
        .lifecycle
        .create_deployment("nope", "v1", manifest(SITE_FILES), SiteConfig::default())
        .unwrap_err();
    assert!(matches!(err, Error::AppNotFound));
}

#[tokio::test]
async fn test_second_upload_rejected() {
    let h = harness();
    deploy(&h, "v1").await;

    let err = h
        .lifecycle
        .upload_deployment("blog", "v1", Cursor::new(tarball(SITE_FILES)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyUploaded));
}

#[tokio::test]
async fn test_upload_unknown_deployment() {
    let h = harness();
    let err = h
        .lifecycle
        .upload_deployment("blog", "ghost", Cursor::new(tarball(SITE_FILES)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeploymentNotFound));
}

// ============================================================================
// Archive validation
// ============================================================================

async fn failed_upload(files: &[(&str, &[u8])]) -> (Harness, Error) {
    let h = harness();
    h.lifecycle
        .create_deployment("blog", "v1", manifest(SITE_FILES), SiteConfig::default())
        .unwrap();
    let err = h
        .lifecycle
        .upload_deployment("blog", "v1", Cursor::new(tarball(files)))
        .await
        .unwrap_err();
    (h, err)
}

#[tokio::test]
async fn test_upload_rejects_unexpected_file() {
    let (h, err) = failed_upload(&[
        ("index.html", b"<h1>hello</h1>"),
        ("assets/app.js", b"console.log('hi')"),
        ("extra.txt", b"surprise"),
    ])
    .await;

    assert!(matches!(err, Error::Archive(ArchiveError::UnexpectedFile(ref p)) if p == "extra.txt"));
    assert_eq!(err.status_code(), hyper::StatusCode::BAD_REQUEST);
    assert!(!h.lifecycle.get_deployment("blog", "v1").unwrap().deployment.is_uploaded());
}

#[tokio::test]
async fn test_upload_rejects_size_mismatch() {
    let (_, err) = failed_upload(&[
        ("index.html", b"<h1>hello, world</h1>"),
        ("assets/app.js", b"console.log('hi')"),
    ])
    .await;

    assert!(matches!(
        err,
        Error::Archive(ArchiveError::SizeMismatch { ref path, .. }) if path == "index.html"
    ));
}

#[tokio::test]
async fn test_upload_rejects_missing_file() {
    let (_, err) = failed_upload(&[("index.html", b"<h1>hello</h1>")]).await;
    assert!(matches!(err, Error::Archive(ArchiveError::MissingFile(ref p)) if p == "assets/app.js"));
}

#[tokio::test]
async fn test_upload_rejects_duplicate_entry() {
    let (_, err) = failed_upload(&[
        ("index.html", b"<h1>hello</h1>"),
        ("index.html", b"<h1>hello</h1>"),
        ("assets/app.js", b"console.log('hi')"),
    ])
    .await;
    assert!(matches!(err, Error::Archive(ArchiveError::DuplicateFile(_))));
}

#[tokio::test]
async fn test_upload_rejects_path_traversal() {
    let h = harness();
    h.lifecycle
        .create_deployment("blog", "v1", manifest(SITE_FILES), SiteConfig::default())
        .unwrap();

    let archive = tarball(&[("../escape.html", b"<h1>hello</h1>")]);
    let err = h
        .lifecycle
        .upload_deployment("blog", "v1", Cursor::new(archive))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Archive(ArchiveError::InvalidPath(_))));
    assert!(h.storage.is_empty());
}

#[tokio::test]
async fn test_failed_upload_can_be_retried() {
    let (h, _) = failed_upload(&[("index.html", b"<h1>hello</h1>")]).await;

    let deployment = h
        .lifecycle
        .upload_deployment("blog", "v1", Cursor::new(tarball(SITE_FILES)))
        .await
        .unwrap();
    assert!(deployment.is_uploaded());
}

#[tokio::test]
async fn test_cancelled_upload_stays_pending_and_can_be_retried() {
    let h = harness();
    h.lifecycle
        .create_deployment("blog", "v1", manifest(SITE_FILES), SiteConfig::default())
        .unwrap();

    // Part of the archive, then the sender stalls
    let archive = tarball(SITE_FILES);
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    writer.write_all(&archive[..700]).await.unwrap();

    let result = tokio::time::timeout(
        StdDuration::from_millis(100),
        h.lifecycle.upload_deployment("blog", "v1", reader),
    )
    .await;
    assert!(result.is_err());
    drop(writer);

    let deployment = h.lifecycle.get_deployment("blog", "v1").unwrap().deployment;
    assert_eq!(deployment.uploaded_at, None);
    assert_eq!(deployment.status(h.clock.now(), false), DeploymentStatus::Pending);

    let deployment = h
        .lifecycle
        .upload_deployment("blog", "v1", Cursor::new(archive))
        .await
        .unwrap();
    assert!(deployment.is_uploaded());
    let data = h
        .storage
        .get(&format!("{}index.html", deployment.storage_key_prefix))
        .await
        .unwrap();
    assert_eq!(&data[..], b"<h1>hello</h1>");
}

#[tokio::test]
async fn test_leading_dot_slash_entries_accepted() {
    let h = harness();
    h.lifecycle
        .create_deployment("blog", "v1", manifest(SITE_FILES), SiteConfig::default())
        .unwrap();

    let archive = tarball(&[
        ("./index.html", b"<h1>hello</h1>"),
        ("./assets/app.js", b"console.log('hi')"),
    ]);
    let deployment = h
        .lifecycle
        .upload_deployment("blog", "v1", Cursor::new(archive))
        .await
        .unwrap();
    assert!(deployment.is_uploaded());
}

// ============================================================================
// Assignment and expiry
// ============================================================================

#[tokio::test]
async fn test_assign_then_unassign_starts_expiry() {
    let h = harness();
    deploy(&h, "d1").await;
    h.lifecycle.create_site("blog", "main").unwrap();

    let info = h.lifecycle.assign_site("blog", "main", "d1").unwrap();
    assert_eq!(info.deployment_name.as_deref(), Some("d1"));
    assert_eq!(expire_at(&h, "d1"), None);

    let now = h.clock.now();
    let info = h.lifecycle.unassign_site("blog", "main").unwrap();
    assert_eq!(info.deployment_name, None);
    assert_eq!(expire_at(&h, "d1"), Some(now + ttl()));
}

#[tokio::test]
async fn test_reassign_recomputes_both_deployments() {
    let h = harness();
    deploy(&h, "d1").await;
    deploy(&h, "d2").await;
    h.lifecycle.create_site("blog", "main").unwrap();

    h.lifecycle.assign_site("blog", "main", "d1").unwrap();
    h.clock.advance(Duration::minutes(5));
    let now = h.clock.now();
    h.lifecycle.assign_site("blog", "main", "d2").unwrap();

    assert_eq!(expire_at(&h, "d1"), Some(now + ttl()));
    assert_eq!(expire_at(&h, "d2"), None);

    let d1 = h.lifecycle.get_deployment("blog", "d1").unwrap();
    let d2 = h.lifecycle.get_deployment("blog", "d2").unwrap();
    assert!(d1.site_names.is_empty());
    assert_eq!(d2.site_names, vec!["main".to_string()]);
}

#[tokio::test]
async fn test_expiry_hysteresis() {
    let h = harness();
    deploy(&h, "d1").await;
    h.lifecycle.create_site("blog", "main").unwrap();
    h.lifecycle.assign_site("blog", "main", "d1").unwrap();

    // t0: first release
    let t0 = h.clock.now();
    h.lifecycle.unassign_site("blog", "main").unwrap();
    assert_eq!(expire_at(&h, "d1"), Some(t0 + ttl()));

    // t1 < t0 + ttl: rebound, window cleared
    h.clock.advance(Duration::minutes(10));
    h.lifecycle.assign_site("blog", "main", "d1").unwrap();
    assert_eq!(expire_at(&h, "d1"), None);

    // t2: released again, window starts over
    h.clock.advance(Duration::minutes(20));
    let t2 = h.clock.now();
    h.lifecycle.unassign_site("blog", "main").unwrap();
    assert_eq!(expire_at(&h, "d1"), Some(t2 + ttl()));
    assert_ne!(expire_at(&h, "d1"), Some(t0 + ttl()));
}

#[tokio::test]
async fn test_recompute_expiry_is_idempotent() {
    let h = harness();
    let d1 = deploy(&h, "d1").await;
    h.lifecycle.create_site("blog", "main").unwrap();
    h.lifecycle.assign_site("blog", "main", "d1").unwrap();
    h.lifecycle.unassign_site("blog", "main").unwrap();
    let first = expire_at(&h, "d1");
    assert!(first.is_some());

    h.clock.advance(Duration::minutes(30));
    let now = h.clock.now();
    let recomputed = h
        .lifecycle
        .db()
        .transaction(|tx| recompute_expiry(tx, "blog", &d1.id, ttl(), now))
        .unwrap();

    assert_eq!(recomputed, first);
    assert_eq!(expire_at(&h, "d1"), first);
}

#[tokio::test]
async fn test_shared_deployment_expires_after_last_release() {
    let h = harness();
    deploy(&h, "d1").await;
    h.lifecycle.create_site("blog", "main").unwrap();
    h.lifecycle.create_site("blog", "staging").unwrap();
    h.lifecycle.assign_site("blog", "main", "d1").unwrap();
    h.lifecycle.assign_site("blog", "staging", "d1").unwrap();

    h.lifecycle.unassign_site("blog", "main").unwrap();
    assert_eq!(expire_at(&h, "d1"), None);

    let now = h.clock.now();
    h.lifecycle.unassign_site("blog", "staging").unwrap();
    assert_eq!(expire_at(&h, "d1"), Some(now + ttl()));
}

#[tokio::test]
async fn test_reassign_same_deployment_is_noop() {
    let h = harness();
    deploy(&h, "d1").await;
    h.lifecycle.create_site("blog", "main").unwrap();

    h.lifecycle.assign_site("blog", "main", "d1").unwrap();
    h.clock.advance(Duration::minutes(1));
    let info = h.lifecycle.assign_site("blog", "main", "d1").unwrap();

    assert_eq!(info.deployment_name.as_deref(), Some("d1"));
    assert_eq!(expire_at(&h, "d1"), None);
}

#[tokio::test]
async fn test_expired_deployment_cannot_be_assigned() {
    let h = harness();
    deploy(&h, "d1").await;
    h.lifecycle.create_site("blog", "main").unwrap();
    h.lifecycle.assign_site("blog", "main", "d1").unwrap();
    h.lifecycle.unassign_site("blog", "main").unwrap();

    h.clock.advance(ttl() + Duration::seconds(1));
    let err = h.lifecycle.assign_site("blog", "main", "d1").unwrap_err();
    assert!(matches!(err, Error::DeploymentExpired));

    let listed = h.lifecycle.list_deployments("blog").unwrap();
    let status = listed[0].deployment.status(h.clock.now(), false);
    assert_eq!(status, DeploymentStatus::Expired);
}

#[tokio::test]
async fn test_pending_deployment_cannot_be_assigned() {
    let h = harness();
    h.lifecycle
        .create_deployment("blog", "d1", manifest(SITE_FILES), SiteConfig::default())
        .unwrap();
    h.lifecycle.create_site("blog", "main").unwrap();

    let err = h.lifecycle.assign_site("blog", "main", "d1").unwrap_err();
    assert!(matches!(err, Error::DeploymentNotUploaded));

    let err = h.lifecycle.assign_site("blog", "main", "missing").unwrap_err();
    assert!(matches!(err, Error::DeploymentNotFound));
}

#[tokio::test]
async fn test_assign_to_missing_site() {
    let h = harness();
    deploy(&h, "d1").await;

    let err = h.lifecycle.assign_site("blog", "main", "d1").unwrap_err();
    assert!(matches!(err, Error::SiteNotFound));

    let err = h.lifecycle.create_site("blog", "preview").unwrap_err();
    assert!(matches!(err, Error::UndefinedSite));
}

#[tokio::test]
async fn test_create_site_is_idempotent() {
    let h = harness();
    let first = h.lifecycle.create_site("blog", "main").unwrap();
    let second = h.lifecycle.create_site("blog", "main").unwrap();
    assert_eq!(first.site.id, second.site.id);
    assert_eq!(h.lifecycle.list_sites("blog").unwrap().len(), 1);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_mark_once() {
    let h = Arc::new(harness());
    h.lifecycle
        .create_deployment("blog", "v1", manifest(SITE_FILES), SiteConfig::default())
        .unwrap();

    let a = h
        .lifecycle
        .upload_deployment("blog", "v1", Cursor::new(tarball(SITE_FILES)));
    let b = h
        .lifecycle
        .upload_deployment("blog", "v1", Cursor::new(tarball(SITE_FILES)));
    let (a, b) = tokio::join!(a, b);

    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    let failure = if a.is_err() { a } else { b };
    assert!(matches!(failure, Err(Error::AlreadyUploaded)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_losing_upload_does_not_replace_served_files() {
    let h = Arc::new(harness());
    h.lifecycle
        .create_deployment("blog", "v1", manifest(&[("index.html", b"AAA")]), SiteConfig::default())
        .unwrap();

    // The slow upload passes the pending check, then waits for its archive
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let slow = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.lifecycle.upload_deployment("blog", "v1", reader).await })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let winner = h
        .lifecycle
        .upload_deployment("blog", "v1", Cursor::new(tarball(&[("index.html", b"AAA")])))
        .await
        .unwrap();
    h.lifecycle.create_site("blog", "main").unwrap();
    h.lifecycle.assign_site("blog", "main", "v1").unwrap();

    writer.write_all(&tarball(&[("index.html", b"BBB")])).await.unwrap();
    drop(writer);
    let loser = slow.await.unwrap();
    assert!(matches!(loser, Err(Error::AlreadyUploaded)));

    let current = h.lifecycle.get_deployment("blog", "v1").unwrap().deployment;
    assert_eq!(current.storage_key_prefix, winner.storage_key_prefix);
    let served = h
        .storage
        .get(&format!("{}index.html", current.storage_key_prefix))
        .await
        .unwrap();
    assert_eq!(&served[..], b"AAA");
}

#[test]
fn test_concurrent_create_same_name() {
    let h = harness();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    h.lifecycle
                        .create_deployment("blog", "v1", manifest(SITE_FILES), SiteConfig::default())
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, Error::UsedName)));
}
