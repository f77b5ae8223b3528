//! Event fan-out across modules with different watch sets.

use std::sync::{Arc, Mutex};

use reconhive_core::event::EventKind;
use reconhive_core::lifecycle::{ScanLifecycle, ScanOutcome};
use reconhive_core::module::{ModuleCatalog, ModuleDescriptor};

use crate::helpers::config::scan_config;
use crate::helpers::modules::{Recorder, Relay, register};

#[tokio::test]
async fn test_e2e_chain_dns_to_url_to_finding() {
    let dir = tempfile::tempdir().unwrap();
    let findings = Arc::new(Mutex::new(Vec::new()));

    let mut catalog = ModuleCatalog::new();
    register(&mut catalog, "web", || {
        Relay::new("web", EventKind::DnsName, EventKind::Url).with_data("https://a.test/")
    });
    register(&mut catalog, "check", || {
        Relay::new("check", EventKind::Url, EventKind::Finding)
    });
    let f = Arc::clone(&findings);
    register(&mut catalog, "sink", move || {
        Recorder::new(
            ModuleDescriptor::new("sink").watches([EventKind::Finding]),
            Arc::clone(&f),
        )
    });

    let config = scan_config(dir.path(), "chain", &["web", "check", "sink"]);
    let mut scan = ScanLifecycle::new(config, catalog);
    scan.prepare().await.unwrap();
    let report = scan.run().await.unwrap();

    assert_eq!(report.outcome, ScanOutcome::Success);
    let dispatch = report.dispatch.unwrap();
    // SCAN, DNS_NAME seed, URL, FINDING
    assert_eq!(dispatch.submitted, 4);

    let findings = findings.lock().unwrap();
    assert_eq!(findings.len(), 1);
    let finding = &findings[0];
    assert_eq!(finding.data_str(), Some("https://a.test/"));
    // SCAN(0) -> DNS_NAME(1) -> URL(2) -> FINDING(3)
    assert_eq!(finding.depth(), 3);
    assert!(finding.source().is_some());
}

#[tokio::test]
async fn test_e2e_out_of_scope_events_skip_scoped_modules() {
    let dir = tempfile::tempdir().unwrap();
    let scoped = Arc::new(Mutex::new(Vec::new()));
    let open = Arc::new(Mutex::new(Vec::new()));

    let mut catalog = ModuleCatalog::new();
    register(&mut catalog, "resolver", || {
        Relay::new("resolver", EventKind::DnsName, EventKind::Url).with_data("https://elsewhere.test/")
    });
    let s = Arc::clone(&scoped);
    register(&mut catalog, "scoped", move || {
        Recorder::new(
            ModuleDescriptor::new("scoped")
                .watches([EventKind::Url])
                .in_scope_only(true),
            Arc::clone(&s),
        )
    });
    let o = Arc::clone(&open);
    register(&mut catalog, "open", move || {
        Recorder::new(
            ModuleDescriptor::new("open").watches([EventKind::Url]),
            Arc::clone(&o),
        )
    });

    let config = scan_config(dir.path(), "scoping", &["resolver", "scoped", "open"]);
    let mut scan = ScanLifecycle::new(config, catalog);
    scan.prepare().await.unwrap();
    scan.run().await.unwrap();

    assert!(scoped.lock().unwrap().is_empty());
    assert_eq!(open.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_e2e_each_watcher_gets_each_event_once() {
    let dir = tempfile::tempdir().unwrap();
    let a = Arc::new(Mutex::new(Vec::new()));
    let b = Arc::new(Mutex::new(Vec::new()));

    let mut catalog = ModuleCatalog::new();
    let sa = Arc::clone(&a);
    register(&mut catalog, "a", move || {
        Recorder::new(
            ModuleDescriptor::new("a").watches([EventKind::DnsName, EventKind::Scan]),
            Arc::clone(&sa),
        )
    });
    let sb = Arc::clone(&b);
    register(&mut catalog, "b", move || {
        Recorder::new(
            ModuleDescriptor::new("b").watches([EventKind::DnsName]),
            Arc::clone(&sb),
        )
    });

    let mut config = scan_config(dir.path(), "fanout", &["a", "b"]);
    config.scope.targets = vec!["a.test".to_owned(), "b.test".to_owned(), "10.0.0.1".to_owned()];
    let mut scan = ScanLifecycle::new(config, catalog);
    scan.prepare().await.unwrap();
    scan.run().await.unwrap();

    let kinds = |v: &Arc<Mutex<Vec<reconhive_core::Event>>>| {
        let mut k: Vec<_> = v.lock().unwrap().iter().map(|e| e.kind()).collect();
        k.sort();
        k
    };
    assert_eq!(kinds(&a), vec![EventKind::Scan, EventKind::DnsName, EventKind::DnsName]);
    assert_eq!(kinds(&b), vec![EventKind::DnsName, EventKind::DnsName]);
}
