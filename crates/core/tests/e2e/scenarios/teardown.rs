//! Scan home cleanup.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use reconhive_core::lifecycle::{ScanLifecycle, ScanOutcome};
use reconhive_core::module::ModuleCatalog;

use crate::helpers::config::scan_config;
use crate::helpers::modules::{Artifact, ShellTool, register};

#[tokio::test]
async fn test_e2e_home_removed_when_empty() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = ModuleCatalog::new();
    let ready = Arc::new(AtomicUsize::new(0));
    register(&mut catalog, "quiet", move || {
        ShellTool::new("quiet", "exit 0", Arc::clone(&ready))
    });

    let mut scan = ScanLifecycle::new(scan_config(dir.path(), "empty_home", &["quiet"]), catalog);
    scan.prepare().await.unwrap();
    let home = scan.home().to_path_buf();
    assert!(home.is_dir());

    let report = scan.run().await.unwrap();
    assert_eq!(report.outcome, ScanOutcome::NoFindings);
    assert!(!home.exists());
    // parent of per-scan homes stays
    assert!(dir.path().join("scans").is_dir());
}

#[tokio::test]
async fn test_e2e_home_kept_when_artifact_exists() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = ModuleCatalog::new();
    register(&mut catalog, "writer", || Artifact::new("writer"));

    let mut scan = ScanLifecycle::new(scan_config(dir.path(), "kept_home", &["writer"]), catalog);
    scan.prepare().await.unwrap();
    let home = scan.home().to_path_buf();
    let handle = scan.handle();

    scan.run().await.unwrap();
    drop(scan);

    let artifact = home.join("writer").join("output.txt");
    assert!(artifact.is_file());
    assert_eq!(std::fs::read_to_string(artifact).unwrap(), "\"a.test\"\n");
    assert_eq!(handle.teardown_count(), 1);
}

#[tokio::test]
async fn test_e2e_word_cloud_saved_into_home() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = ModuleCatalog::new();
    let ready = Arc::new(AtomicUsize::new(0));
    register(&mut catalog, "quiet", move || {
        ShellTool::new("quiet", "exit 0", Arc::clone(&ready))
    });

    let mut config = scan_config(dir.path(), "cloud_home", &["quiet"]);
    config.word_cloud.enabled = true;
    config.scope.targets = vec!["mail.example.com".to_owned()];

    let mut scan = ScanLifecycle::new(config, catalog);
    scan.prepare().await.unwrap();
    let home = scan.home().to_path_buf();
    scan.run().await.unwrap();

    let cloud = std::fs::read_to_string(home.join("wordcloud.tsv")).unwrap();
    assert!(cloud.lines().any(|l| l == "1\tmail"), "{cloud}");
}

#[tokio::test]
async fn test_e2e_failed_prepare_leaves_no_home() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = ModuleCatalog::new();

    let mut scan = ScanLifecycle::new(scan_config(dir.path(), "bad_preset", &["unknown"]), catalog);
    let err = scan.prepare().await.unwrap_err();
    assert!(err.to_string().contains("unknown module"));
    assert!(!scan.home().exists());
    let handle = scan.handle();
    drop(scan);
    assert_eq!(handle.teardown_count(), 1);
    assert!(!dir.path().join("scans").exists());
}
