//! A failing module must not affect its siblings.

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use reconhive_core::event::EventKind;
use reconhive_core::lifecycle::{ScanLifecycle, ScanOutcome};
use reconhive_core::module::{ModuleCatalog, ModuleDescriptor};

use crate::helpers::config::scan_config;
use crate::helpers::modules::{Failing, Recorder, ShellTool, register};

#[tokio::test]
async fn test_e2e_failing_handler_does_not_stop_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let ready = Arc::new(AtomicUsize::new(0));

    let mut catalog = ModuleCatalog::new();
    register(&mut catalog, "broken", || Failing::new("broken", EventKind::DnsName));
    register(&mut catalog, "finder", move || {
        ShellTool::new("finder", "echo 'FOUND admin panel'", Arc::clone(&ready))
    });
    let s = Arc::clone(&seen);
    register(&mut catalog, "sink", move || {
        Recorder::new(
            ModuleDescriptor::new("sink").watches([EventKind::Finding]),
            Arc::clone(&s),
        )
    });

    let config = scan_config(dir.path(), "isolation", &["broken", "finder", "sink"]);
    let mut scan = ScanLifecycle::new(config, catalog);
    scan.prepare().await.unwrap();
    let report = scan.run().await.unwrap();

    assert_eq!(report.outcome, ScanOutcome::Success);
    let dispatch = report.dispatch.expect("scan dispatched");
    assert_eq!(dispatch.findings, 1);
    assert_eq!(dispatch.failures.len(), 1);
    assert_eq!(dispatch.failures[0].module, "broken");
    assert!(dispatch.failures[0].reason.contains("deliberate failure"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].data_str(), Some("admin panel"));
    assert_eq!(seen[0].module(), "finder");
}

#[tokio::test]
async fn test_e2e_tool_without_output_yields_no_findings() {
    let dir = tempfile::tempdir().unwrap();
    let ready = Arc::new(AtomicUsize::new(0));

    let mut catalog = ModuleCatalog::new();
    register(&mut catalog, "ghost", move || {
        ShellTool::new("ghost", "exec reconhive-definitely-not-installed", Arc::clone(&ready))
    });

    let config = scan_config(dir.path(), "ghost_scan", &["ghost"]);
    let mut scan = ScanLifecycle::new(config, catalog);
    scan.prepare().await.unwrap();
    let report = scan.run().await.unwrap();

    // sh starts, the exec inside it fails, the module sees no output
    assert_eq!(report.outcome, ScanOutcome::NoFindings);
    assert!(report.error.is_none());
}
