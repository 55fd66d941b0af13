//! Integration tests for asset provisioning against an in-memory fetcher.

use circlenet_ext::fakes::{FakeResponse, MemoryFetcher};
use circlenet_ext::manifest::{ArchiveEntry, AssetEntry};
use circlenet_ext::provision::extract_archive;
use circlenet_ext::{
    AssetManifest, AssetProvisioner, DetectionError, DetectorConfig, RetryPolicy,
    WorkspaceLayout,
};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;

const MODEL_1: &str = "https://assets.test/WCF/model/model1_best.pth";
const MODEL_2: &str = "https://assets.test/WCF/model/model2_best.pth";
const ARCHIVE: &str = "https://assets.test/WCF/CircleNet_Zip.zip";

fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, body) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn script_archive() -> Vec<u8> {
    build_zip(&[
        ("CircleNet_Zip/src/run_detection_for_scn.py", b"print('detect')\n"),
        ("CircleNet_Zip/src/lib/opts.py", b"ARCH = 'dla_34'\n"),
    ])
}

fn setup(root: &Path) -> (AssetManifest, WorkspaceLayout) {
    let config = DetectorConfig::default()
        .with_root(root)
        .with_assets(vec![MODEL_1.to_string(), MODEL_2.to_string()], ARCHIVE);
    let layout = WorkspaceLayout::from_config(&config).unwrap();
    (AssetManifest::from_config(&config), layout)
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_base_ms: 1,
    }
}

fn model_path(layout: &WorkspaceLayout, name: &str) -> PathBuf {
    layout.model_dir().join(name)
}

/// Test: first pass downloads and extracts everything, second pass fetches nothing
#[tokio::test]
async fn test_provisioning_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let (manifest, layout) = setup(root.path());
    let fetcher = Arc::new(
        MemoryFetcher::new()
            .body(MODEL_1, b"weights-1".to_vec())
            .body(MODEL_2, b"weights-2".to_vec())
            .body(ARCHIVE, script_archive()),
    );
    let provisioner = AssetProvisioner::new(fetcher.clone(), RetryPolicy::none());
    let cancel = CancellationToken::new();

    let first = provisioner
        .ensure_assets(&manifest, &layout, &cancel)
        .await
        .expect("first provisioning failed");
    assert_eq!(first.downloaded, 3);
    assert_eq!(first.skipped, 0);
    assert_eq!(first.extracted, 2);
    assert_eq!(fetcher.request_count(), 3);

    assert_eq!(
        std::fs::read(model_path(&layout, "model1_best.pth")).unwrap(),
        b"weights-1"
    );
    assert!(layout.archive_path().exists());
    assert!(layout
        .scripts_dir()
        .join("CircleNet_Zip/src/run_detection_for_scn.py")
        .exists());
    assert!(layout.scripts_dir().join("CircleNet_Zip/src/lib/opts.py").exists());

    let second = provisioner
        .ensure_assets(&manifest, &layout, &cancel)
        .await
        .expect("second provisioning failed");
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.extracted, 0);
    assert_eq!(fetcher.request_count(), 3, "no fetch on second pass");
}

/// Test: a removed extraction root is rebuilt from the staged archive without traffic
#[tokio::test]
async fn test_missing_scripts_dir_is_re_extracted() {
    let root = tempfile::tempdir().unwrap();
    let (manifest, layout) = setup(root.path());
    let fetcher = Arc::new(
        MemoryFetcher::new()
            .body(MODEL_1, b"w1".to_vec())
            .body(MODEL_2, b"w2".to_vec())
            .body(ARCHIVE, script_archive()),
    );
    let provisioner = AssetProvisioner::new(fetcher.clone(), RetryPolicy::none());
    let cancel = CancellationToken::new();

    provisioner.ensure_assets(&manifest, &layout, &cancel).await.unwrap();
    std::fs::remove_dir_all(layout.scripts_dir()).unwrap();

    let summary = provisioner.ensure_assets(&manifest, &layout, &cancel).await.unwrap();
    assert_eq!(summary.downloaded, 0);
    assert_eq!(summary.extracted, 2);
    assert_eq!(fetcher.request_count(), 3);
}

/// Test: a 302 is followed exactly once, relative to the request URL
#[tokio::test]
async fn test_single_redirect_is_followed() {
    let root = tempfile::tempdir().unwrap();
    let (manifest, layout) = setup(root.path());
    let fetcher = Arc::new(
        MemoryFetcher::new()
            .route(
                MODEL_1,
                FakeResponse::Redirect {
                    status: 302,
                    location: "/mirror/model1_best.pth".to_string(),
                },
            )
            .body("https://assets.test/mirror/model1_best.pth", b"mirrored".to_vec())
            .body(MODEL_2, b"w2".to_vec())
            .body(ARCHIVE, script_archive()),
    );
    let provisioner = AssetProvisioner::new(fetcher.clone(), RetryPolicy::none());

    provisioner
        .ensure_assets(&manifest, &layout, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        &fetcher.requests()[..2],
        &[
            MODEL_1.to_string(),
            "https://assets.test/mirror/model1_best.pth".to_string()
        ]
    );
    assert_eq!(
        std::fs::read(model_path(&layout, "model1_best.pth")).unwrap(),
        b"mirrored"
    );
}

/// Test: a second redirect is a failure and leaves no partial file behind
#[tokio::test]
async fn test_second_redirect_fails() {
    let root = tempfile::tempdir().unwrap();
    let (manifest, layout) = setup(root.path());
    let fetcher = Arc::new(
        MemoryFetcher::new()
            .route(
                MODEL_1,
                FakeResponse::Redirect {
                    status: 302,
                    location: "https://cdn.test/hop1".to_string(),
                },
            )
            .route(
                "https://cdn.test/hop1",
                FakeResponse::Redirect {
                    status: 302,
                    location: "https://cdn.test/hop2".to_string(),
                },
            )
            .body("https://cdn.test/hop2", b"never".to_vec()),
    );
    let provisioner = AssetProvisioner::new(fetcher.clone(), RetryPolicy::none());

    let err = provisioner
        .ensure_assets(&manifest, &layout, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DetectionError::NetworkFailure {
            status: Some(302),
            ..
        }
    ));
    assert_eq!(
        fetcher.requests(),
        vec![MODEL_1.to_string(), "https://cdn.test/hop1".to_string()]
    );
    assert!(!model_path(&layout, "model1_best.pth").exists());
    assert!(!model_path(&layout, "model1_best.pth.part").exists());
}

/// Test: an archive with an escaping entry writes nothing at all
#[tokio::test]
async fn test_path_traversal_archive_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let (manifest, layout) = setup(root.path());
    let evil = build_zip(&[
        ("CircleNet_Zip/src/run_detection_for_scn.py", b"print('ok')\n"),
        ("../evil.txt", b"escaped"),
    ]);
    let fetcher = Arc::new(
        MemoryFetcher::new()
            .body(MODEL_1, b"w1".to_vec())
            .body(MODEL_2, b"w2".to_vec())
            .body(ARCHIVE, evil),
    );
    let provisioner = AssetProvisioner::new(fetcher, RetryPolicy::none());

    let err = provisioner
        .ensure_assets(&manifest, &layout, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        DetectionError::UnsafeArchiveEntry { entry } => assert_eq!(entry, "../evil.txt"),
        other => panic!("expected UnsafeArchiveEntry, got {:?}", other),
    }
    assert!(!layout.model_dir().join("evil.txt").exists());
    assert!(!layout.scripts_dir().exists());
}

/// Test: an archive that fails part way through leaves no tree behind, so a
/// later pass cannot mistake a half-written scripts directory for a finished one
#[tokio::test]
async fn test_failed_extraction_leaves_no_partial_tree() {
    let root = tempfile::tempdir().unwrap();
    let (manifest, layout) = setup(root.path());
    // "x" is written as a file, so "x/y" cannot get a parent directory
    let broken = build_zip(&[
        ("CircleNet_Zip/src/run_detection_for_scn.py", b"print('ok')\n"),
        ("x", b"file"),
        ("x/y", b"nested"),
    ]);
    let fetcher = Arc::new(
        MemoryFetcher::new()
            .body(MODEL_1, b"w1".to_vec())
            .body(MODEL_2, b"w2".to_vec())
            .body(ARCHIVE, broken),
    );
    let provisioner = AssetProvisioner::new(fetcher, RetryPolicy::none());
    let cancel = CancellationToken::new();

    let first = provisioner.ensure_assets(&manifest, &layout, &cancel).await;
    assert!(first.is_err(), "extraction should fail: {:?}", first);
    assert!(!layout.scripts_dir().exists());
    assert!(!layout.model_dir().join("python_scripts.part").exists());

    // The archive is cached now, but the missing tree forces another attempt
    let second = provisioner.ensure_assets(&manifest, &layout, &cancel).await;
    assert!(second.is_err(), "second pass should not succeed: {:?}", second);
    assert!(!layout.scripts_dir().exists());
}

/// Test: re-extracting replaces the previous tree instead of merging into it
#[test]
fn test_extract_replaces_existing_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("out");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("stale.py"), b"old").unwrap();

    let archive = dir.path().join("fresh.zip");
    std::fs::write(&archive, build_zip(&[("fresh.py", b"new")])).unwrap();

    assert_eq!(extract_archive(&archive, &root).unwrap(), 1);
    assert_eq!(std::fs::read(root.join("fresh.py")).unwrap(), b"new");
    assert!(!root.join("stale.py").exists());
    assert!(!dir.path().join("out.part").exists());
}

/// Test: backslash and absolute entry names are rejected as well
#[test]
fn test_extract_rejects_windows_style_escapes() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("out");

    for name in ["..\\..\\evil.txt", "C:/evil.txt"] {
        let archive = dir.path().join("bad.zip");
        std::fs::write(&archive, build_zip(&[("fine.txt", b"ok"), (name, b"bad")])).unwrap();

        let err = extract_archive(&archive, &root).unwrap_err();
        assert!(
            matches!(err, DetectionError::UnsafeArchiveEntry { .. }),
            "{} should be rejected",
            name
        );
        assert!(!root.join("fine.txt").exists());
    }
}

/// Test: transient failures are retried until the source answers
#[tokio::test]
async fn test_transient_failure_is_retried() {
    let root = tempfile::tempdir().unwrap();
    let (manifest, layout) = setup(root.path());
    let fetcher = Arc::new(
        MemoryFetcher::new()
            .route(
                MODEL_1,
                FakeResponse::Flaky {
                    failures: 2,
                    body: b"eventually".to_vec(),
                },
            )
            .body(MODEL_2, b"w2".to_vec())
            .body(ARCHIVE, script_archive()),
    );
    let provisioner = AssetProvisioner::new(fetcher.clone(), fast_retry(2));

    provisioner
        .ensure_assets(&manifest, &layout, &CancellationToken::new())
        .await
        .expect("retry should recover");

    let model_1_requests = fetcher
        .requests()
        .iter()
        .filter(|url| url.as_str() == MODEL_1)
        .count();
    assert_eq!(model_1_requests, 3);
    assert_eq!(
        std::fs::read(model_path(&layout, "model1_best.pth")).unwrap(),
        b"eventually"
    );
}

/// Test: 5xx is retried up to the limit, then reported
#[tokio::test]
async fn test_server_error_exhausts_retries() {
    let root = tempfile::tempdir().unwrap();
    let (manifest, layout) = setup(root.path());
    let fetcher = Arc::new(MemoryFetcher::new().route(MODEL_1, FakeResponse::Status(503)));
    let provisioner = AssetProvisioner::new(fetcher.clone(), fast_retry(2));

    let err = provisioner
        .ensure_assets(&manifest, &layout, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DetectionError::NetworkFailure {
            status: Some(503),
            ..
        }
    ));
    assert_eq!(fetcher.request_count(), 3);
}

/// Test: a 404 is permanent and not retried
#[tokio::test]
async fn test_not_found_is_not_retried() {
    let root = tempfile::tempdir().unwrap();
    let (manifest, layout) = setup(root.path());
    let fetcher = Arc::new(MemoryFetcher::new().route(MODEL_1, FakeResponse::Status(404)));
    let provisioner = AssetProvisioner::new(fetcher.clone(), fast_retry(3));

    let err = provisioner
        .ensure_assets(&manifest, &layout, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(!err.is_transient());
    assert_eq!(fetcher.request_count(), 1);
}

/// Test: a manifest entry outside the root fails before any request
#[tokio::test]
async fn test_escaping_manifest_entry_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let layout = WorkspaceLayout::new(root.path().join("workspace"));
    let manifest = AssetManifest {
        files: vec![
            AssetEntry {
                url: MODEL_1.to_string(),
                destination: PathBuf::from("models_and_pythonfiles/model1_best.pth"),
            },
            AssetEntry {
                url: MODEL_2.to_string(),
                destination: PathBuf::from("../outside.pth"),
            },
        ],
        archive: ArchiveEntry {
            url: ARCHIVE.to_string(),
            staging: PathBuf::from("models_and_pythonfiles/zip/python_scripts.zip"),
            extract_to: PathBuf::from("models_and_pythonfiles/python_scripts"),
        },
    };
    let fetcher = Arc::new(MemoryFetcher::new().body(MODEL_1, b"w1".to_vec()));
    let provisioner = AssetProvisioner::new(fetcher.clone(), RetryPolicy::none());

    let err = provisioner
        .ensure_assets(&manifest, &layout, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DetectionError::InvalidManifest(_)));
    assert_eq!(fetcher.request_count(), 0);
    assert!(!root.path().join("outside.pth").exists());
}

/// Test: a cancelled token stops provisioning before the first request
#[tokio::test]
async fn test_cancelled_before_start() {
    let root = tempfile::tempdir().unwrap();
    let (manifest, layout) = setup(root.path());
    let fetcher = Arc::new(MemoryFetcher::new().body(MODEL_1, b"w1".to_vec()));
    let provisioner = AssetProvisioner::new(fetcher.clone(), RetryPolicy::none());

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = provisioner
        .ensure_assets(&manifest, &layout, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DetectionError::Cancelled));
    assert_eq!(fetcher.request_count(), 0);
}
