//! Deadly modules only run when the preset allows them.

use std::sync::{Arc, Mutex};

use reconhive_core::event::{Event, EventKind};
use reconhive_core::lifecycle::{ScanLifecycle, ScanOutcome};
use reconhive_core::module::{ModuleCatalog, ModuleDescriptor};

use crate::helpers::config::scan_config;
use crate::helpers::modules::{Recorder, Relay, register};

fn catalog(findings: &Arc<Mutex<Vec<Event>>>) -> ModuleCatalog {
    let mut catalog = ModuleCatalog::new();
    register(&mut catalog, "benign", || {
        Relay::new("benign", EventKind::DnsName, EventKind::Finding).with_data("benign finding")
    });
    register(&mut catalog, "nuke", || {
        Relay::new("nuke", EventKind::DnsName, EventKind::Finding)
            .with_data("deadly finding")
            .deadly()
    });
    let f = Arc::clone(findings);
    register(&mut catalog, "sink", move || {
        Recorder::new(
            ModuleDescriptor::new("sink").watches([EventKind::Finding]),
            Arc::clone(&f),
        )
    });
    catalog
}

async fn finding_modules(allow_deadly: bool) -> Vec<String> {
    let dir = tempfile::tempdir().unwrap();
    let findings = Arc::new(Mutex::new(Vec::new()));
    let mut config = scan_config(dir.path(), "deadly_gate", &["benign", "nuke", "sink"]);
    config.scan.allow_deadly = allow_deadly;

    let mut scan = ScanLifecycle::new(config, catalog(&findings));
    scan.prepare().await.unwrap();
    let report = scan.run().await.unwrap();
    assert_eq!(report.outcome, ScanOutcome::Success);

    let mut modules: Vec<String> = findings
        .lock()
        .unwrap()
        .iter()
        .map(|f| f.module().to_owned())
        .collect();
    modules.sort();
    modules
}

#[tokio::test]
async fn test_e2e_deadly_module_skipped_without_allow_deadly() {
    assert_eq!(finding_modules(false).await, vec!["benign"]);
}

#[tokio::test]
async fn test_e2e_deadly_module_runs_with_allow_deadly() {
    assert_eq!(finding_modules(true).await, vec!["benign", "nuke"]);
}
