//! `reconhive scan` command handler

use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex};

use colored::Colorize;
use dialoguer::Confirm;
use dialoguer::console::Term;
use serde::Serialize;
use tracing::info;

use reconhive_core::config::{ModuleEntry, ReconConfig};
use reconhive_core::error::{PresetError, ReconError};
use reconhive_core::lifecycle::{ScanHandle, ScanLifecycle, ScanOutcome, ScanReport};
use reconhive_core::module::ModuleCatalog;

use crate::cli::ScanArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Slot holding the scan the interrupt handler should cancel.
#[derive(Debug, Clone, Default)]
pub struct ActiveScan(Arc<Mutex<Option<ScanHandle>>>);

impl ActiveScan {
    pub fn set(&self, handle: ScanHandle) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn current(&self) -> Option<ScanHandle> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Execute the `scan` command.
pub async fn execute(
    args: ScanArgs,
    mut config: ReconConfig,
    active: &ActiveScan,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let catalog = reconhive_modules::builtin_catalog();
    apply_args(&mut config, &args, &catalog);

    if args.current_preset {
        let preset = PresetDump {
            toml: config.to_toml()?,
        };
        return writer.render(&preset);
    }

    let confirm = !config.scan.yes && !config.scan.dry_run && stdin_is_tty();
    let mut scan = ScanLifecycle::new(config, catalog);
    let handle = scan.handle();
    active.set(handle.clone());

    let result = drive(&mut scan, &handle, confirm).await;
    // tear down before releasing the slot
    drop(scan);
    active.clear();

    let report = result?;
    writer.render(&report)?;
    outcome_result(&report)
}

async fn drive(
    scan: &mut ScanLifecycle,
    handle: &ScanHandle,
    confirm: bool,
) -> Result<ScanReport, CliError> {
    match scan.prepare().await {
        Ok(()) => {}
        Err(ReconError::Preset(PresetError::Cancelled)) => {
            return Err(CliError::Aborted {
                scan: handle.name().to_owned(),
            });
        }
        Err(e) => return Err(e.into()),
    }
    if confirm && !handle.is_cancelled() {
        confirm_execution(handle).await?;
    }
    Ok(scan.run().await?)
}

/// Asks before executing. Declining cancels the scan, as does an interrupt
/// while the prompt is open.
async fn confirm_execution(handle: &ScanHandle) -> Result<(), CliError> {
    let prompt = format!("Scan ready. Execute {}?", handle.name());
    let answer = tokio::task::spawn_blocking(move || {
        Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact_on(&Term::stderr())
    });
    tokio::select! {
        answer = answer => {
            let confirmed = answer
                .map_err(|e| CliError::Command(format!("prompt task failed: {e}")))?
                .map_err(|e| CliError::Command(format!("prompt failed: {e}")))?;
            if !confirmed {
                info!(scan = %handle.name(), "scan declined at prompt");
                handle.cancel();
            }
        }
        () = handle.cancelled() => {}
    }
    Ok(())
}

fn stdin_is_tty() -> bool {
    std::io::stdin().is_terminal()
}

/// Folds command-line options into the preset.
///
/// Values given on the command line replace the preset's, switches only
/// turn options on. `--flags` enables every matching catalog module and
/// `--exclude-flags` disables every enabled module carrying a listed flag.
pub fn apply_args(config: &mut ReconConfig, args: &ScanArgs, catalog: &ModuleCatalog) {
    if !args.targets.is_empty() {
        config.scope.targets = args.targets.clone();
    }
    if !args.blacklist.is_empty() {
        config.scope.blacklist = args.blacklist.clone();
    }
    config.scope.strict |= args.strict_scope;
    if let Some(name) = &args.name {
        config.scan.name = Some(name.clone());
    }
    config.scan.allow_deadly |= args.allow_deadly;
    config.scan.dry_run |= args.dry_run;
    config.scan.yes |= args.yes;
    config.deps.install |= args.install_deps;

    let mut wanted = args.modules.clone();
    if !args.flags.is_empty() {
        wanted.extend(catalog.select_by_flags(&args.flags, &[]));
    }
    for name in wanted {
        enable_module(config, &name);
    }

    if !args.exclude_flags.is_empty() {
        let kept = catalog.select_by_flags(&[], &args.exclude_flags);
        for entry in config
            .modules
            .iter_mut()
            .filter(|e| e.enabled && catalog.contains(&e.name) && !kept.contains(&e.name))
        {
            info!(module = %entry.name, "module excluded by flag");
            entry.enabled = false;
        }
    }
}

fn enable_module(config: &mut ReconConfig, name: &str) {
    match config.modules.iter_mut().find(|e| e.name == name) {
        Some(entry) => entry.enabled = true,
        None => config.modules.push(ModuleEntry::new(name)),
    }
}

/// Maps the scan outcome to the command result.
fn outcome_result(report: &ScanReport) -> Result<(), CliError> {
    let reason = || report.error.clone().unwrap_or_else(|| report.outcome.to_string());
    match report.outcome {
        ScanOutcome::Success | ScanOutcome::NoFindings => Ok(()),
        ScanOutcome::Aborted => Err(CliError::Aborted {
            scan: report.name.clone(),
        }),
        ScanOutcome::ConfigurationError => Err(CliError::Config(reason())),
        ScanOutcome::FatalError => Err(CliError::Fatal(reason())),
    }
}

#[derive(Serialize)]
pub struct PresetDump {
    pub toml: String,
}

impl Render for PresetDump {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        write!(w, "{}", self.toml)
    }
}

impl Render for ScanReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "Scan: {}", self.name.bold())?;
        writeln!(w, "Home: {}", self.home.display())?;

        let outcome = self.outcome.as_str();
        let outcome = match self.outcome {
            ScanOutcome::Success => outcome.green().bold(),
            ScanOutcome::NoFindings => outcome.normal(),
            ScanOutcome::Aborted => outcome.yellow().bold(),
            ScanOutcome::ConfigurationError | ScanOutcome::FatalError => outcome.red().bold(),
        };
        writeln!(w, "Outcome: {outcome} (phase {})", self.phase)?;
        if let Some(phase) = self.cancelled_in {
            writeln!(w, "Cancelled while {phase}")?;
        }

        match &self.dispatch {
            Some(d) => {
                writeln!(
                    w,
                    "Events: {} submitted, {} deliveries, {} findings",
                    d.submitted, d.dispatched, d.findings
                )?;
                if !d.failures.is_empty() {
                    writeln!(w)?;
                    writeln!(w, "{}", "Module failures:".red())?;
                    for f in &d.failures {
                        writeln!(w, "  {:<20} {}", f.module, f.reason)?;
                    }
                }
            }
            None => writeln!(w, "{}", "Nothing dispatched.".dimmed())?,
        }

        if let Some(error) = &self.error {
            writeln!(w, "Error: {}", error.red())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconhive_core::dispatcher::{DispatchReport, ModuleFailure};
    use reconhive_core::lifecycle::ScanPhase;

    fn catalog() -> ModuleCatalog {
        reconhive_modules::builtin_catalog()
    }

    fn report(outcome: ScanOutcome) -> ScanReport {
        ScanReport {
            name: "brave_otter".to_owned(),
            outcome,
            phase: ScanPhase::Finished,
            cancelled_in: None,
            home: "/tmp/scans/brave_otter".into(),
            dispatch: Some(DispatchReport {
                submitted: 4,
                dispatched: 3,
                findings: 1,
                failures: vec![ModuleFailure {
                    module: "smuggler".to_owned(),
                    event_id: uuid::Uuid::nil(),
                    reason: "tool crashed".to_owned(),
                }],
                cancelled: false,
            }),
            error: None,
        }
    }

    #[test]
    fn test_apply_args_overrides_preset() {
        let mut config = ReconConfig::default();
        config.scope.targets = vec!["old.test".to_owned()];
        let args = ScanArgs {
            targets: vec!["new.test".to_owned()],
            name: Some("named".to_owned()),
            yes: true,
            allow_deadly: true,
            install_deps: true,
            ..Default::default()
        };
        apply_args(&mut config, &args, &catalog());

        assert_eq!(config.scope.targets, vec!["new.test"]);
        assert_eq!(config.scan.name.as_deref(), Some("named"));
        assert!(config.scan.yes);
        assert!(config.scan.allow_deadly);
        assert!(config.deps.install);
        assert!(!config.scan.dry_run);
    }

    #[test]
    fn test_apply_args_keeps_preset_when_flag_absent() {
        let mut config = ReconConfig::default();
        config.scope.targets = vec!["kept.test".to_owned()];
        config.scan.dry_run = true;
        apply_args(&mut config, &ScanArgs::default(), &catalog());
        assert_eq!(config.scope.targets, vec!["kept.test"]);
        assert!(config.scan.dry_run);
    }

    #[test]
    fn test_apply_args_enables_modules_once() {
        let mut config = ReconConfig::default();
        let mut disabled = ModuleEntry::new("smuggler");
        disabled.enabled = false;
        config.modules = vec![disabled];

        let args = ScanArgs {
            modules: vec!["smuggler".to_owned()],
            flags: vec!["active".to_owned()],
            ..Default::default()
        };
        apply_args(&mut config, &args, &catalog());

        assert_eq!(config.modules.len(), 1);
        assert!(config.modules[0].enabled);
    }

    #[test]
    fn test_apply_args_exclude_flags_disables_matching_modules() {
        let mut config = ReconConfig::default();
        config.modules = vec![ModuleEntry::new("smuggler"), ModuleEntry::new("not_builtin")];
        let args = ScanArgs {
            exclude_flags: vec!["aggressive".to_owned()],
            ..Default::default()
        };
        apply_args(&mut config, &args, &catalog());

        assert!(!config.modules[0].enabled);
        // unknown modules are left for preparation to reject
        assert!(config.modules[1].enabled);
    }

    #[test]
    fn test_apply_args_unmatched_flag_enables_nothing() {
        let mut config = ReconConfig::default();
        let args = ScanArgs {
            flags: vec!["passive".to_owned()],
            ..Default::default()
        };
        apply_args(&mut config, &args, &catalog());
        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_outcome_result_mapping() {
        assert!(outcome_result(&report(ScanOutcome::Success)).is_ok());
        assert!(outcome_result(&report(ScanOutcome::NoFindings)).is_ok());

        let aborted = outcome_result(&report(ScanOutcome::Aborted)).expect_err("aborted");
        assert_eq!(aborted.to_string(), "You killed brave_otter");
        assert_eq!(aborted.exit_code(), 1);

        let mut fatal = report(ScanOutcome::FatalError);
        fatal.error = Some("drain did not finish".to_owned());
        let err = outcome_result(&fatal).expect_err("fatal");
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("drain did not finish"));

        let config = outcome_result(&report(ScanOutcome::ConfigurationError)).expect_err("config");
        assert_eq!(config.exit_code(), 2);
    }

    #[test]
    fn test_report_text_lists_failures() {
        colored::control::set_override(false);
        let mut buf = Vec::new();
        report(ScanOutcome::Success)
            .render_text(&mut buf)
            .expect("render should succeed");
        let out = String::from_utf8(buf).expect("utf-8");
        assert!(out.contains("Scan: brave_otter"));
        assert!(out.contains("Outcome: success (phase finished)"));
        assert!(out.contains("4 submitted, 3 deliveries, 1 findings"));
        assert!(out.contains("smuggler"));
        assert!(out.contains("tool crashed"));
    }

    #[test]
    fn test_report_text_without_dispatch() {
        colored::control::set_override(false);
        let mut r = report(ScanOutcome::NoFindings);
        r.dispatch = None;
        let mut buf = Vec::new();
        r.render_text(&mut buf).expect("render should succeed");
        assert!(String::from_utf8(buf).expect("utf-8").contains("Nothing dispatched."));
    }

    #[test]
    fn test_active_scan_slot() {
        let slot = ActiveScan::default();
        assert!(slot.current().is_none());

        let mut config = ReconConfig::default();
        config.scan.name = Some("slot_test".to_owned());
        let scan = ScanLifecycle::new(config, ModuleCatalog::new());
        slot.set(scan.handle());
        assert_eq!(slot.current().map(|h| h.name().to_owned()).as_deref(), Some("slot_test"));

        slot.clear();
        assert!(slot.current().is_none());
    }
}
