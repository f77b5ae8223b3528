//! Module contract, catalog and per-scan registry.
//!
//! A module declares the event kinds it watches and produces and handles
//! one event at a time. Results go back to the dispatcher through
//! [`ModuleContext::emit`], never through the return value, because a module
//! may keep emitting while it streams the output of an external tool.
//!
//! [`Module`] uses `impl Future` returns; [`DynModule`] is its
//! dyn-compatible twin so modules can live in `Vec<Box<dyn DynModule>>`.
//!
//! ```text
//! ModuleCatalog (name → factory)
//!        │ resolve(preset entries)
//!        ▼
//! ModuleRegistry (instances) ── deadly gate ── setup ──► Vec<Arc<dyn DynModule>>
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::config::ModuleEntry;
use crate::error::{ModuleError, PresetError};
use crate::event::{Event, EventKind, MODULE_SCAN};
use crate::process::ProcessStreamer;

/// Boxed `Send` future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Touches the target.
pub const FLAG_ACTIVE: &str = "active";
/// Only talks to third parties.
pub const FLAG_PASSIVE: &str = "passive";
/// Noisy or likely to trip defenses.
pub const FLAG_AGGRESSIVE: &str = "aggressive";
/// Highly intrusive, gated behind `allow_deadly`.
pub const FLAG_DEADLY: &str = "deadly";

// ─── ModuleDescriptor ────────────────────────────────────────────────

/// Static description of a module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub description: String,
    /// Kinds delivered to `handle_event`
    pub watched_kinds: BTreeSet<EventKind>,
    /// Kinds the module may emit
    pub produced_kinds: BTreeSet<EventKind>,
    pub flags: BTreeSet<String>,
    /// Only receive events that pass the scope filter
    pub in_scope_only: bool,
    /// External tools needed at runtime
    pub deps: Vec<ToolDependency>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            watched_kinds: BTreeSet::new(),
            produced_kinds: BTreeSet::new(),
            flags: BTreeSet::new(),
            in_scope_only: false,
            deps: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn watches(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.watched_kinds.extend(kinds);
        self
    }

    pub fn produces(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.produced_kinds.extend(kinds);
        self
    }

    pub fn flags<S: Into<String>>(mut self, flags: impl IntoIterator<Item = S>) -> Self {
        self.flags.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn in_scope_only(mut self, in_scope_only: bool) -> Self {
        self.in_scope_only = in_scope_only;
        self
    }

    pub fn dependency(mut self, dep: ToolDependency) -> Self {
        self.deps.push(dep);
        self
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_deadly(&self) -> bool {
        self.has_flag(FLAG_DEADLY)
    }

    pub fn watches_kind(&self, kind: EventKind) -> bool {
        self.watched_kinds.contains(&kind)
    }

    pub fn may_produce(&self, kind: EventKind) -> bool {
        self.produced_kinds.contains(&kind)
    }
}

// ─── ToolDependency ──────────────────────────────────────────────────

/// An external tool a module shells out to.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDependency {
    pub name: String,
    pub check: ToolCheck,
    /// Install command; `{tools_dir}` is substituted before running
    pub install: Vec<String>,
}

/// How to tell whether a tool is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ToolCheck {
    /// Executable looked up in `PATH`
    Executable(String),
    /// File relative to the tools directory
    ToolsPath(PathBuf),
}

impl ToolDependency {
    pub fn executable(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            check: ToolCheck::Executable(name.clone()),
            name,
            install: Vec::new(),
        }
    }

    pub fn tools_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            check: ToolCheck::ToolsPath(path.into()),
            install: Vec::new(),
        }
    }

    pub fn install_with<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.install = command.into_iter().map(Into::into).collect();
        self
    }

    /// Install command with `{tools_dir}` expanded.
    pub fn install_command(&self, tools_dir: &Path) -> Vec<String> {
        let dir = tools_dir.display().to_string();
        self.install
            .iter()
            .map(|arg| arg.replace("{tools_dir}", &dir))
            .collect()
    }
}

// ─── ModuleContext ───────────────────────────────────────────────────

/// Per-module handle given to every `handle_event` call.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    name: Arc<str>,
    produced: Arc<BTreeSet<EventKind>>,
    submit_tx: mpsc::UnboundedSender<Event>,
    streamer: ProcessStreamer,
    module_dir: PathBuf,
    tools_dir: PathBuf,
}

impl ModuleContext {
    /// `module_dir` is the sub-path of the scan home reserved for this module.
    pub fn new(
        descriptor: &ModuleDescriptor,
        submit_tx: mpsc::UnboundedSender<Event>,
        streamer: ProcessStreamer,
        module_dir: PathBuf,
        tools_dir: PathBuf,
    ) -> Self {
        Self {
            name: Arc::from(descriptor.name.as_str()),
            produced: Arc::new(descriptor.produced_kinds.clone()),
            submit_tx,
            streamer,
            module_dir,
            tools_dir,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submits `event` to the dispatcher.
    ///
    /// # Errors
    ///
    /// [`ModuleError::UndeclaredKind`] if the kind is not in
    /// `produced_kinds`; the event is not submitted.
    pub fn emit(&self, event: Event) -> Result<(), ModuleError> {
        if !self.produced.contains(&event.kind()) {
            error!(
                module = %self.name,
                kind = %event.kind(),
                "module emitted an event kind it does not declare"
            );
            return Err(ModuleError::UndeclaredKind {
                module: self.name.to_string(),
                kind: event.kind(),
            });
        }
        self.submit_tx
            .send(event)
            .map_err(|_| ModuleError::ScanClosed)
    }

    /// Builds an event caused by `source` and emits it.
    pub fn emit_derived(
        &self,
        kind: EventKind,
        data: impl Into<serde_json::Value>,
        source: &Event,
    ) -> Result<(), ModuleError> {
        self.emit(Event::derived(kind, data, source, self.name.as_ref()))
    }

    pub fn streamer(&self) -> &ProcessStreamer {
        &self.streamer
    }

    pub fn tools_dir(&self) -> &Path {
        &self.tools_dir
    }

    /// This module's directory under the scan home, created on first use.
    pub async fn module_dir(&self) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.module_dir).await?;
        Ok(self.module_dir.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.streamer.is_cancelled()
    }
}

/// Passed to [`Module::setup`] once per scan.
#[derive(Debug, Clone)]
pub struct SetupContext {
    pub scan_name: String,
    pub tools_dir: PathBuf,
}

// ─── Module trait ────────────────────────────────────────────────────

/// Contract every module implements.
///
/// `handle_event` is only called with kinds in `watched_kinds`, and only
/// with in-scope events when `in_scope_only` is set; the dispatcher checks
/// both. Returning `Err` marks this invocation as failed without affecting
/// other modules.
///
/// ```ignore
/// struct Echo { descriptor: ModuleDescriptor }
///
/// impl Module for Echo {
///     fn descriptor(&self) -> &ModuleDescriptor { &self.descriptor }
///
///     async fn handle_event(&self, event: Arc<Event>, ctx: ModuleContext) -> Result<(), ModuleError> {
///         ctx.emit_derived(EventKind::Finding, event.data().clone(), &event)
///     }
/// }
/// ```
pub trait Module: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    /// One-time preparation. A failing module is dropped from the scan.
    fn setup(
        &mut self,
        _ctx: &SetupContext,
    ) -> impl Future<Output = Result<(), ModuleError>> + Send {
        async { Ok(()) }
    }

    fn handle_event(
        &self,
        event: Arc<Event>,
        ctx: ModuleContext,
    ) -> impl Future<Output = Result<(), ModuleError>> + Send;
}

/// dyn-compatible [`Module`].
pub trait DynModule: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    fn setup<'a>(&'a mut self, ctx: &'a SetupContext) -> BoxFuture<'a, Result<(), ModuleError>>;

    fn handle_event(
        &self,
        event: Arc<Event>,
        ctx: ModuleContext,
    ) -> BoxFuture<'_, Result<(), ModuleError>>;
}

impl<T: Module> DynModule for T {
    fn descriptor(&self) -> &ModuleDescriptor {
        Module::descriptor(self)
    }

    fn setup<'a>(&'a mut self, ctx: &'a SetupContext) -> BoxFuture<'a, Result<(), ModuleError>> {
        Box::pin(Module::setup(self, ctx))
    }

    fn handle_event(
        &self,
        event: Arc<Event>,
        ctx: ModuleContext,
    ) -> BoxFuture<'_, Result<(), ModuleError>> {
        Box::pin(Module::handle_event(self, event, ctx))
    }
}

impl fmt::Debug for dyn DynModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynModule")
            .field("name", &self.descriptor().name)
            .finish()
    }
}

// ─── ModuleCatalog ───────────────────────────────────────────────────

/// Builds a module instance from its preset entry.
pub type ModuleFactory =
    Arc<dyn Fn(&ModuleEntry) -> Result<Box<dyn DynModule>, ModuleError> + Send + Sync>;

/// Every module the binary knows how to build, by name.
#[derive(Default, Clone)]
pub struct ModuleCatalog {
    factories: BTreeMap<String, ModuleFactory>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// - [`PresetError::ReservedModuleName`] for `scan`, the origin of seed events
    /// - [`PresetError::DuplicateModule`] if `name` is taken
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), PresetError>
    where
        F: Fn(&ModuleEntry) -> Result<Box<dyn DynModule>, ModuleError> + Send + Sync + 'static,
    {
        let name = name.into();
        if name == MODULE_SCAN {
            return Err(PresetError::ReservedModuleName { name });
        }
        if self.factories.contains_key(&name) {
            return Err(PresetError::DuplicateModule { name });
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Builds the module named by `entry`.
    pub fn build(&self, entry: &ModuleEntry) -> Result<Box<dyn DynModule>, PresetError> {
        let factory = self
            .factories
            .get(&entry.name)
            .ok_or_else(|| PresetError::UnknownModule {
                name: entry.name.clone(),
            })?;
        factory(entry).map_err(|e| PresetError::SetupFailed {
            module: entry.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Descriptors of every module built with default options.
    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.factories
            .keys()
            .filter_map(|name| match self.build(&ModuleEntry::new(name.clone())) {
                Ok(module) => Some(module.descriptor().clone()),
                Err(e) => {
                    warn!(module = %name, error = %e, "cannot describe module");
                    None
                }
            })
            .collect()
    }

    /// Module names carrying any of `require` (all when empty) and none of
    /// `exclude`.
    pub fn select_by_flags(&self, require: &[String], exclude: &[String]) -> Vec<String> {
        self.descriptors()
            .into_iter()
            .filter(|d| require.is_empty() || require.iter().any(|f| d.has_flag(f)))
            .filter(|d| !exclude.iter().any(|f| d.has_flag(f)))
            .map(|d| d.name)
            .collect()
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("modules", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ─── ModuleRegistry ──────────────────────────────────────────────────

/// Modules resolved for one scan, in preset order.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn DynModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds every enabled entry through `catalog`.
    pub fn resolve<'a>(
        catalog: &ModuleCatalog,
        entries: impl IntoIterator<Item = &'a ModuleEntry>,
    ) -> Result<Self, PresetError> {
        let mut registry = Self::new();
        for entry in entries.into_iter().filter(|e| e.enabled) {
            registry.register(catalog.build(entry)?)?;
        }
        Ok(registry)
    }

    /// # Errors
    ///
    /// [`PresetError::ReservedModuleName`] or [`PresetError::DuplicateModule`]
    /// as for [`ModuleCatalog::register`].
    pub fn register(&mut self, module: Box<dyn DynModule>) -> Result<(), PresetError> {
        let name = &module.descriptor().name;
        if name == MODULE_SCAN {
            return Err(PresetError::ReservedModuleName { name: name.clone() });
        }
        if self.get(name).is_some() {
            return Err(PresetError::DuplicateModule { name: name.clone() });
        }
        self.modules.push(module);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<Box<dyn DynModule>, PresetError> {
        let pos = self
            .modules
            .iter()
            .position(|m| m.descriptor().name == name)
            .ok_or_else(|| PresetError::UnknownModule {
                name: name.to_owned(),
            })?;
        Ok(self.modules.remove(pos))
    }

    pub fn get(&self, name: &str) -> Option<&dyn DynModule> {
        self.modules
            .iter()
            .find(|m| m.descriptor().name == name)
            .map(|m| m.as_ref())
    }

    pub fn count(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn list(&self) -> Vec<&ModuleDescriptor> {
        self.modules.iter().map(|m| m.descriptor()).collect()
    }

    /// Names of registered modules flagged `deadly`.
    pub fn deadly(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| m.descriptor().is_deadly())
            .map(|m| m.descriptor().name.clone())
            .collect()
    }

    /// Removes deadly modules unless `allow_deadly`; returns their names.
    pub fn apply_deadly_gate(&mut self, allow_deadly: bool) -> Vec<String> {
        if allow_deadly {
            return Vec::new();
        }
        let excluded = self.deadly();
        self.modules.retain(|m| !m.descriptor().is_deadly());
        excluded
    }

    /// Runs every module's `setup`, dropping the ones that fail.
    ///
    /// Returns the failures.
    pub async fn setup_all(&mut self, ctx: &SetupContext) -> Vec<(String, ModuleError)> {
        let mut failures = Vec::new();
        let mut kept = Vec::with_capacity(self.modules.len());
        for mut module in std::mem::take(&mut self.modules) {
            match module.setup(ctx).await {
                Ok(()) => kept.push(module),
                Err(e) => {
                    warn!(module = %module.descriptor().name, error = %e, "module setup failed, disabling");
                    failures.push((module.descriptor().name.clone(), e));
                }
            }
        }
        self.modules = kept;
        failures
    }

    /// Freezes the registry for dispatch.
    pub fn into_shared(self) -> Vec<Arc<dyn DynModule>> {
        self.modules.into_iter().map(Arc::from).collect()
    }
}
