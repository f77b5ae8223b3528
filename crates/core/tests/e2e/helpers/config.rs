//! Preset builder for E2E tests.

use std::path::Path;

use reconhive_core::config::{ModuleEntry, ReconConfig};

/// Preset rooted in `root` with one target and the given modules.
///
/// Word cloud is off so the home directory only holds module output.
pub fn scan_config(root: &Path, name: &str, modules: &[&str]) -> ReconConfig {
    let mut config = ReconConfig::default();
    config.general.home_dir = root.join("scans");
    config.general.tools_dir = root.join("tools");
    config.scan.name = Some(name.to_owned());
    config.scan.grace_period_secs = 1;
    config.scan.drain_timeout_secs = 10;
    config.scope.targets = vec!["a.test".to_owned()];
    config.word_cloud.enabled = false;
    config.modules = modules.iter().map(|m| ModuleEntry::new(*m)).collect();
    config
}
