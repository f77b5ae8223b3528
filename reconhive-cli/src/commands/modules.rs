//! `reconhive modules` command handler

use std::io::Write;

use colored::Colorize;
use serde::Serialize;

use reconhive_core::module::{FLAG_DEADLY, ModuleCatalog, ModuleDescriptor, ToolCheck};

use crate::cli::ModulesArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `modules` command.
pub fn execute(args: ModulesArgs, writer: &OutputWriter) -> Result<(), CliError> {
    let catalog = reconhive_modules::builtin_catalog();
    let listing = build_listing(&catalog, &args);
    writer.render(&listing)
}

fn build_listing(catalog: &ModuleCatalog, args: &ModulesArgs) -> ModuleListing {
    let selected = catalog.select_by_flags(&args.flags, &args.exclude_flags);
    let mut modules: Vec<ModuleRow> = catalog
        .descriptors()
        .iter()
        .filter(|d| selected.contains(&d.name))
        .map(ModuleRow::from)
        .collect();
    modules.sort_by(|a, b| a.name.cmp(&b.name));
    ModuleListing { modules }
}

#[derive(Serialize)]
pub struct ModuleListing {
    pub modules: Vec<ModuleRow>,
}

#[derive(Serialize)]
pub struct ModuleRow {
    pub name: String,
    pub description: String,
    pub flags: Vec<String>,
    pub watches: Vec<String>,
    pub produces: Vec<String>,
    pub in_scope_only: bool,
    pub deps: Vec<String>,
}

impl From<&ModuleDescriptor> for ModuleRow {
    fn from(d: &ModuleDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            description: d.description.clone(),
            flags: d.flags.iter().cloned().collect(),
            watches: d.watched_kinds.iter().map(|k| k.as_str().to_owned()).collect(),
            produces: d.produced_kinds.iter().map(|k| k.as_str().to_owned()).collect(),
            in_scope_only: d.in_scope_only,
            deps: d
                .deps
                .iter()
                .map(|dep| match &dep.check {
                    ToolCheck::Executable(exe) => exe.clone(),
                    ToolCheck::ToolsPath(path) => path.display().to_string(),
                })
                .collect(),
        }
    }
}

impl Render for ModuleListing {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        if self.modules.is_empty() {
            return writeln!(w, "{}", "No modules match.".dimmed());
        }

        writeln!(
            w,
            "{:<16} {:<28} {:<16} {:<16} Description",
            "Module", "Flags", "Watches", "Produces"
        )?;
        writeln!(w, "{}", "-".repeat(100))?;
        for m in &self.modules {
            let flags = m.flags.join(",");
            let flags = if m.flags.iter().any(|f| f == FLAG_DEADLY) {
                flags.red().bold()
            } else {
                flags.normal()
            };
            writeln!(
                w,
                "{:<16} {:<28} {:<16} {:<16} {}",
                m.name.bold(),
                flags,
                m.watches.join(","),
                m.produces.join(","),
                m.description
            )?;
        }
        Ok(())
    }
}
