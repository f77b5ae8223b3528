//! Cancelling a running scan.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use reconhive_core::lifecycle::{ScanLifecycle, ScanOutcome, ScanPhase};
use reconhive_core::module::ModuleCatalog;

use crate::helpers::assertions::{DEFAULT_TIMEOUT, wait_until};
use crate::helpers::config::scan_config;
use crate::helpers::modules::{ShellTool, Stalled, register};

const POLITE: &str = "echo ready; exec sleep 30";
const STUBBORN: &str = "trap '' TERM; echo ready; while :; do sleep 0.05; done";

fn catalog(ready: &Arc<AtomicUsize>) -> ModuleCatalog {
    let mut catalog = ModuleCatalog::new();
    let r = Arc::clone(ready);
    register(&mut catalog, "polite", move || ShellTool::new("polite", POLITE, Arc::clone(&r)));
    let r = Arc::clone(ready);
    register(&mut catalog, "stubborn", move || {
        ShellTool::new("stubborn", STUBBORN, Arc::clone(&r))
    });
    catalog
}

#[tokio::test]
async fn test_e2e_cancel_terminates_both_sessions_within_grace() {
    let dir = tempfile::tempdir().unwrap();
    let ready = Arc::new(AtomicUsize::new(0));
    let config = scan_config(dir.path(), "cancel_two", &["polite", "stubborn"]);

    let mut scan = ScanLifecycle::new(config, catalog(&ready));
    scan.prepare().await.expect("prepare");
    let handle = scan.handle();
    let home = scan.home().to_path_buf();

    let run = tokio::spawn(async move { scan.run().await });

    wait_until("both tools to be ready", DEFAULT_TIMEOUT, || {
        ready.load(Ordering::SeqCst) == 2 && handle.status().live_sessions == 2
    })
    .await;
    assert_eq!(handle.phase(), ScanPhase::Running);

    let started = Instant::now();
    handle.cancel();
    assert_eq!(handle.phase(), ScanPhase::Cancelling);

    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run should finish after cancel")
        .expect("run task should not panic")
        .expect("run should return a report");

    // grace period is 1s; the stubborn child needs the SIGKILL
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "took {:?}",
        started.elapsed()
    );
    assert_eq!(report.outcome, ScanOutcome::Aborted);
    assert_eq!(report.phase, ScanPhase::Finished);
    assert_eq!(report.cancelled_in, Some(ScanPhase::Running));
    assert_eq!(handle.status().live_sessions, 0);
    assert_eq!(handle.teardown_count(), 1);
    assert!(!home.exists(), "empty home is removed after cancel");
}

#[tokio::test]
async fn test_e2e_cancel_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ready = Arc::new(AtomicUsize::new(0));
    let config = scan_config(dir.path(), "cancel_twice", &["polite"]);

    let mut scan = ScanLifecycle::new(config, catalog(&ready));
    scan.prepare().await.expect("prepare");
    let handle = scan.handle();
    let run = tokio::spawn(async move { scan.run().await });

    wait_until("tool to be ready", DEFAULT_TIMEOUT, || ready.load(Ordering::SeqCst) == 1).await;
    handle.cancel();
    handle.cancel();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.outcome, ScanOutcome::Aborted);
    assert_eq!(report.cancelled_in, Some(ScanPhase::Running));
    assert_eq!(handle.teardown_count(), 1);
}

#[tokio::test]
async fn test_e2e_status_reports_progress_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let ready = Arc::new(AtomicUsize::new(0));
    let config = scan_config(dir.path(), "status_scan", &["polite"]);

    let mut scan = ScanLifecycle::new(config, catalog(&ready));
    scan.prepare().await.expect("prepare");
    let handle = scan.handle();
    let run = tokio::spawn(async move { scan.run().await });

    wait_until("tool to be ready", DEFAULT_TIMEOUT, || ready.load(Ordering::SeqCst) == 1).await;
    let status = handle.status();
    assert_eq!(status.name, "status_scan");
    assert_eq!(status.phase, ScanPhase::Running);
    assert!(status.events >= 2, "SCAN root plus target seed");
    assert!(status.in_flight >= 1);

    handle.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_e2e_cancel_with_stuck_handler_is_still_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let entered = Arc::new(AtomicUsize::new(0));
    let mut config = scan_config(dir.path(), "cancel_stuck", &["stalled"]);
    config.scan.drain_timeout_secs = 1;

    let mut catalog = ModuleCatalog::new();
    let e = Arc::clone(&entered);
    register(&mut catalog, "stalled", move || Stalled::new("stalled", Arc::clone(&e)));

    let mut scan = ScanLifecycle::new(config, catalog);
    scan.prepare().await.expect("prepare");
    let handle = scan.handle();
    let run = tokio::spawn(async move { scan.run().await });

    wait_until("handler to start", DEFAULT_TIMEOUT, || entered.load(Ordering::SeqCst) == 1).await;
    handle.cancel();

    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run should finish after the drain timeout")
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, ScanOutcome::Aborted);
    assert_eq!(report.phase, ScanPhase::Failed);
    assert_eq!(report.cancelled_in, Some(ScanPhase::Running));
    assert!(report.error.as_deref().is_some_and(|e| e.contains("drain")), "{:?}", report.error);
}
