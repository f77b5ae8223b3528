//! `reconhive deps` command handler

use std::io::Write;

use colored::Colorize;
use serde::Serialize;
use tracing::{info, warn};

use reconhive_core::config::ReconConfig;
use reconhive_core::deps::{DependencyInstaller, SystemInstaller};
use reconhive_core::module::{ModuleCatalog, ModuleDescriptor};

use crate::cli::{DepsAction, DepsArgs};
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `deps` command.
pub async fn execute(
    args: DepsArgs,
    config: &ReconConfig,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let catalog = reconhive_modules::builtin_catalog();
    let (modules, install) = match args.action {
        DepsAction::Install { modules } => (modules, true),
        DepsAction::Check { modules } => (modules, false),
    };
    let descriptors = select(&catalog, &modules)?;
    let installer = SystemInstaller::new(config.general.tools_dir.clone(), install);

    let report = run(&installer, &descriptors, install).await;
    writer.render(&report)?;

    let failed = report.failed();
    if failed > 0 {
        return Err(CliError::Dependency(format!(
            "{failed} of {} dependencies unavailable",
            report.rows.len()
        )));
    }
    Ok(())
}

/// Descriptors for `names`, or every module when `names` is empty.
fn select(catalog: &ModuleCatalog, names: &[String]) -> Result<Vec<ModuleDescriptor>, CliError> {
    if let Some(unknown) = names.iter().find(|n| !catalog.contains(n)) {
        return Err(CliError::Command(format!("unknown module: {unknown}")));
    }
    let mut descriptors: Vec<_> = catalog
        .descriptors()
        .into_iter()
        .filter(|d| names.is_empty() || names.contains(&d.name))
        .collect();
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(descriptors)
}

async fn run(
    installer: &SystemInstaller,
    descriptors: &[ModuleDescriptor],
    install: bool,
) -> DepsReport {
    let mut rows = Vec::new();
    for descriptor in descriptors {
        for dep in &descriptor.deps {
            let status = if installer.is_available(dep) {
                DepStatus::Present
            } else if !install {
                DepStatus::Missing
            } else {
                match installer.ensure(dep).await {
                    Ok(()) => {
                        info!(module = %descriptor.name, tool = %dep.name, "dependency installed");
                        DepStatus::Installed
                    }
                    Err(e) => {
                        warn!(module = %descriptor.name, tool = %dep.name, error = %e, "dependency install failed");
                        DepStatus::Failed(e.to_string())
                    }
                }
            };
            rows.push(DepRow {
                module: descriptor.name.clone(),
                tool: dep.name.clone(),
                status,
            });
        }
    }
    DepsReport {
        tools_dir: installer.tools_dir().display().to_string(),
        rows,
    }
}

#[derive(Serialize)]
pub struct DepsReport {
    pub tools_dir: String,
    pub rows: Vec<DepRow>,
}

impl DepsReport {
    fn failed(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| matches!(r.status, DepStatus::Missing | DepStatus::Failed(_)))
            .count()
    }
}

#[derive(Serialize)]
pub struct DepRow {
    pub module: String,
    pub tool: String,
    pub status: DepStatus,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum DepStatus {
    Present,
    Installed,
    Missing,
    Failed(String),
}

impl Render for DepsReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "Tools directory: {}", self.tools_dir)?;
        if self.rows.is_empty() {
            return writeln!(w, "{}", "No dependencies.".dimmed());
        }
        writeln!(w, "{:<16} {:<16} Status", "Module", "Tool")?;
        writeln!(w, "{}", "-".repeat(60))?;
        for row in &self.rows {
            let status = match &row.status {
                DepStatus::Present => "present".green(),
                DepStatus::Installed => "installed".green().bold(),
                DepStatus::Missing => "missing".yellow(),
                DepStatus::Failed(reason) => format!("failed: {reason}").red(),
            };
            writeln!(w, "{:<16} {:<16} {}", row.module, row.tool, status)?;
        }
        Ok(())
    }
}
