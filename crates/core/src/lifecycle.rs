//! Scan lifecycle state machine.
//!
//! ```text
//! Created ──prepare()──► Prepared ──run()──► Running ──► Finished
//!                                               │           ▲
//!                                           cancel()        │
//!                                               ▼           │
//!                                          Cancelling ──────┤
//!                                                           ▼
//!                                                        Failed
//! ```
//!
//! `prepare` validates the preset and resolves modules before touching the
//! filesystem; the scan home is created last, so a failed preparation leaves
//! no directory behind. Teardown runs exactly once on every terminal path,
//! including when the lifecycle is dropped without `run`.
//!
//! The CLI drives the lifecycle and holds a [`ScanHandle`] for interrupts and
//! status queries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use rand::seq::IndexedRandom;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReconConfig;
use crate::deps::{DependencyInstaller, SystemInstaller};
use crate::dispatcher::{DispatchReport, DispatchStats, Dispatcher, ScanDirs};
use crate::error::{PresetError, ReconError};
use crate::event::{Event, EventKind, MODULE_SCAN};
use crate::metrics as m;
use crate::module::{DynModule, ModuleCatalog, ModuleDescriptor, ModuleRegistry, SetupContext};
use crate::process::ProcessStreamer;
use crate::scope::{Scope, ScopeFilter};
use crate::wordcloud::WordCloud;

/// Extra time granted to reapers beyond the grace period.
const REAP_MARGIN: Duration = Duration::from_secs(1);

// ─── phase & outcome ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    Created,
    Prepared,
    Running,
    Cancelling,
    Finished,
    Failed,
}

impl ScanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Prepared => "prepared",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a scan ended, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    /// At least one FINDING or VULNERABILITY
    Success,
    NoFindings,
    /// Cancelled before completion
    Aborted,
    ConfigurationError,
    FatalError,
}

impl ScanOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NoFindings => "no_findings",
            Self::Aborted => "aborted",
            Self::ConfigurationError => "configuration_error",
            Self::FatalError => "fatal_error",
        }
    }

    /// Outcome for an error that stopped the scan.
    pub fn from_error(err: &ReconError) -> Self {
        match err {
            ReconError::Preset(PresetError::Cancelled) => Self::Aborted,
            ReconError::Config(_) | ReconError::Preset(_) => Self::ConfigurationError,
            _ => Self::FatalError,
        }
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── status ──────────────────────────────────────────────────────────

/// Read-only snapshot for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub name: String,
    pub phase: ScanPhase,
    /// Phase the scan was in when `cancel` was first called
    pub cancelled_in: Option<ScanPhase>,
    pub home: PathBuf,
    pub events: u64,
    pub findings: u64,
    pub failures: u64,
    pub in_flight: usize,
    pub live_sessions: usize,
}

/// Result of [`ScanLifecycle::run`].
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub name: String,
    pub outcome: ScanOutcome,
    pub phase: ScanPhase,
    pub cancelled_in: Option<ScanPhase>,
    pub home: PathBuf,
    /// Absent for dry runs and scans cancelled before dispatch
    pub dispatch: Option<DispatchReport>,
    pub error: Option<String>,
}

// ─── shared state & handle ───────────────────────────────────────────

#[derive(Debug)]
struct Shared {
    name: String,
    home: PathBuf,
    phase: watch::Sender<ScanPhase>,
    cancel: CancellationToken,
    cancelled_in: Mutex<Option<ScanPhase>>,
    streamer: ProcessStreamer,
    stats: OnceLock<Arc<DispatchStats>>,
    teardowns: AtomicU32,
}

impl Shared {
    fn phase(&self) -> ScanPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: ScanPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(scan = %self.name, from = %previous, to = %phase, "scan phase changed");
        }
    }

    fn cancelled_in(&self) -> Option<ScanPhase> {
        *self.cancelled_in.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle for cancelling and observing a scan from other tasks.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    shared: Arc<Shared>,
}

impl ScanHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn phase(&self) -> ScanPhase {
        self.shared.phase()
    }

    /// Watches phase changes.
    pub fn subscribe(&self) -> watch::Receiver<ScanPhase> {
        self.shared.phase.subscribe()
    }

    /// Requests cancellation. Idempotent; a no-op once the scan is terminal.
    pub fn cancel(&self) {
        let phase = self.shared.phase();
        if phase.is_terminal() {
            return;
        }
        {
            let mut cancelled_in = self
                .shared
                .cancelled_in
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if cancelled_in.is_none() {
                *cancelled_in = Some(phase);
                info!(scan = %self.shared.name, phase = %phase, "cancelling scan");
            }
        }
        self.shared.phase.send_if_modified(|p| {
            if *p == ScanPhase::Running {
                *p = ScanPhase::Cancelling;
                true
            } else {
                false
            }
        });
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await;
    }

    pub fn status(&self) -> ScanStatus {
        let stats = self.shared.stats.get();
        ScanStatus {
            name: self.shared.name.clone(),
            phase: self.shared.phase(),
            cancelled_in: self.shared.cancelled_in(),
            home: self.shared.home.clone(),
            events: stats.map_or(0, |s| s.submitted()),
            findings: stats.map_or(0, |s| s.findings()),
            failures: stats.map_or(0, |s| s.failures()),
            in_flight: stats.map_or(0, |s| s.in_flight()),
            live_sessions: self.shared.streamer.live_sessions(),
        }
    }

    /// How many times teardown ran: 0 before a terminal phase, 1 after.
    pub fn teardown_count(&self) -> u32 {
        self.shared.teardowns.load(Ordering::SeqCst)
    }
}

// ─── lifecycle ───────────────────────────────────────────────────────

struct PreparedScan {
    modules: Vec<Arc<dyn DynModule>>,
    scope: Arc<dyn ScopeFilter>,
    targets: Vec<String>,
}

pub struct ScanLifecycle {
    config: ReconConfig,
    catalog: ModuleCatalog,
    installer: Arc<dyn DependencyInstaller>,
    scope_override: Option<Arc<dyn ScopeFilter>>,
    shared: Arc<Shared>,
    /// Cancels sessions at teardown without marking the scan cancelled
    session_token: CancellationToken,
    prepared: Option<PreparedScan>,
    descriptors: Vec<ModuleDescriptor>,
    word_cloud: Option<Arc<WordCloud>>,
    home_ready: bool,
    dispatched: bool,
    torn_down: bool,
}

impl ScanLifecycle {
    /// Creates a scan in phase `Created`. Nothing touches the filesystem yet.
    pub fn new(config: ReconConfig, catalog: ModuleCatalog) -> Self {
        let name = config.scan.name.clone().unwrap_or_else(random_scan_name);
        let home = config.general.home_dir.join(&name);
        let cancel = CancellationToken::new();
        let session_token = cancel.child_token();
        let streamer = ProcessStreamer::new(
            session_token.clone(),
            Duration::from_secs(config.scan.grace_period_secs),
        );
        let installer = Arc::new(SystemInstaller::new(
            config.general.tools_dir.clone(),
            config.deps.install,
        ));
        let (phase, _) = watch::channel(ScanPhase::Created);

        Self {
            shared: Arc::new(Shared {
                name,
                home,
                phase,
                cancel,
                cancelled_in: Mutex::new(None),
                streamer,
                stats: OnceLock::new(),
                teardowns: AtomicU32::new(0),
            }),
            config,
            catalog,
            installer,
            scope_override: None,
            session_token,
            prepared: None,
            descriptors: Vec::new(),
            word_cloud: None,
            home_ready: false,
            dispatched: false,
            torn_down: false,
        }
    }

    pub fn with_installer(mut self, installer: Arc<dyn DependencyInstaller>) -> Self {
        self.installer = installer;
        self
    }

    /// Replaces the host-based scope built from `[scope]`.
    pub fn with_scope(mut self, scope: Arc<dyn ScopeFilter>) -> Self {
        self.scope_override = Some(scope);
        self
    }

    pub fn handle(&self) -> ScanHandle {
        ScanHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn home(&self) -> &Path {
        &self.shared.home
    }

    pub fn phase(&self) -> ScanPhase {
        self.shared.phase()
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    /// Modules that survived preparation.
    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.descriptors
    }

    /// `Created → Prepared`.
    ///
    /// # Errors
    ///
    /// [`ReconError::Config`] for out-of-range values, [`ReconError::Preset`]
    /// for everything else, [`PresetError::Cancelled`] when the scan is
    /// cancelled before it is ready. No directory exists after a failure.
    pub async fn prepare(&mut self) -> Result<(), ReconError> {
        let phase = self.phase();
        if phase != ScanPhase::Created {
            return Err(PresetError::InvalidPhase {
                operation: "prepare",
                phase: phase.to_string(),
            }
            .into());
        }

        self.config.validate()?;
        self.check_cancelled()?;

        if self.config.scope.targets.is_empty() {
            return Err(PresetError::MissingScope.into());
        }
        let scope: Arc<dyn ScopeFilter> = match &self.scope_override {
            Some(scope) => Arc::clone(scope),
            None => Arc::new(Scope::from_config(&self.config.scope)),
        };

        let mut registry = ModuleRegistry::resolve(&self.catalog, self.config.enabled_modules())?;
        if registry.is_empty() {
            return Err(PresetError::EmptyModuleSet.into());
        }

        let excluded = registry.apply_deadly_gate(self.config.scan.allow_deadly);
        if !excluded.is_empty() {
            warn!(
                modules = %excluded.join(", "),
                "deadly modules are enabled but allow_deadly is off; they will not run"
            );
        }
        if registry.is_empty() {
            return Err(PresetError::DeadlyNotAllowed { modules: excluded }.into());
        }
        if self.config.scan.allow_deadly {
            let deadly = registry.deadly();
            if !deadly.is_empty() {
                warn!(modules = %deadly.join(", "), "running deadly modules");
            }
        }

        for descriptor in registry.list() {
            for dep in &descriptor.deps {
                self.check_cancelled()?;
                // dropping the install future kills the install process
                let ensured = tokio::select! {
                    biased;
                    () = self.shared.cancel.cancelled() => return Err(self.cancelled_error()),
                    ensured = self.installer.ensure(dep) => ensured,
                };
                ensured.map_err(|source| PresetError::MissingDependency {
                    module: descriptor.name.clone(),
                    source,
                })?;
            }
        }

        self.check_cancelled()?;
        let setup_ctx = SetupContext {
            scan_name: self.shared.name.clone(),
            tools_dir: self.config.general.tools_dir.clone(),
        };
        let cancel = self.shared.cancel.clone();
        let failures = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(self.cancelled_error()),
            failures = registry.setup_all(&setup_ctx) => failures,
        };
        if registry.is_empty() {
            let (module, reason) = failures
                .into_iter()
                .next()
                .map(|(name, e)| (name, e.to_string()))
                .unwrap_or_else(|| (String::new(), "no module survived setup".to_owned()));
            return Err(PresetError::SetupFailed { module, reason }.into());
        }

        if self.config.word_cloud.enabled {
            let cloud = WordCloud::new();
            if let Some(path) = &self.config.word_cloud.load_path {
                match cloud.load(path) {
                    Ok(words) => info!(path = %path.display(), words, "loaded word cloud"),
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to load word cloud"),
                }
            }
            self.word_cloud = Some(Arc::new(cloud));
        }

        self.check_cancelled()?;
        tokio::fs::create_dir_all(&self.shared.home)
            .await
            .map_err(|source| PresetError::HomeDir {
                path: self.shared.home.display().to_string(),
                source,
            })?;
        self.home_ready = true;

        self.descriptors = registry.list().into_iter().cloned().collect();
        info!(
            scan = %self.shared.name,
            home = %self.shared.home.display(),
            modules = %self
                .descriptors
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            "scan prepared"
        );

        self.prepared = Some(PreparedScan {
            modules: registry.into_shared(),
            scope,
            targets: self.config.scope.targets.clone(),
        });
        self.shared.set_phase(ScanPhase::Prepared);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), ReconError> {
        if self.shared.cancel.is_cancelled() {
            return Err(self.cancelled_error());
        }
        Ok(())
    }

    fn cancelled_error(&self) -> ReconError {
        info!(scan = %self.shared.name, "scan cancelled during preparation");
        PresetError::Cancelled.into()
    }

    /// `Prepared → Running → Finished | Failed`, then teardown.
    ///
    /// Module failures never fail the run; they are listed in the report.
    ///
    /// # Errors
    ///
    /// Only [`PresetError::InvalidPhase`] when called outside `Prepared`.
    pub async fn run(&mut self) -> Result<ScanReport, ReconError> {
        let phase = self.phase();
        let Some(prepared) = self.prepared.take().filter(|_| phase == ScanPhase::Prepared) else {
            return Err(PresetError::InvalidPhase {
                operation: "run",
                phase: phase.to_string(),
            }
            .into());
        };

        if self.shared.cancel.is_cancelled() {
            info!(scan = %self.shared.name, "scan cancelled before it started");
            return Ok(self.finish(ScanOutcome::Aborted, None, None));
        }

        if self.config.scan.dry_run {
            info!(scan = %self.shared.name, "dry run, nothing dispatched");
            return Ok(self.finish(ScanOutcome::NoFindings, None, None));
        }

        self.shared.set_phase(ScanPhase::Running);
        let dirs = ScanDirs {
            home: self.shared.home.clone(),
            tools_dir: self.config.general.tools_dir.clone(),
        };
        let mut dispatcher = Dispatcher::new(
            prepared.modules,
            prepared.scope,
            self.shared.streamer.clone(),
            &dirs,
        )
        .with_drain_timeout(Duration::from_secs(self.config.scan.drain_timeout_secs));
        if let Some(cloud) = &self.word_cloud {
            dispatcher = dispatcher.with_word_cloud(Arc::clone(cloud));
        }
        let _ = self.shared.stats.set(dispatcher.stats());

        self.seed(&mut dispatcher, &prepared.targets);
        self.dispatched = true;
        info!(scan = %self.shared.name, modules = dispatcher.module_count(), "scan started");

        let result = dispatcher.run(&self.shared.cancel).await;

        self.session_token.cancel();
        self.shared
            .streamer
            .shutdown(self.shared.streamer.grace_period() + REAP_MARGIN)
            .await;

        Ok(match result {
            Ok(report) if report.cancelled || self.shared.cancel.is_cancelled() => {
                self.finish(ScanOutcome::Aborted, Some(report), None)
            }
            Ok(report) => {
                let outcome = if report.findings > 0 {
                    ScanOutcome::Success
                } else {
                    ScanOutcome::NoFindings
                };
                self.finish(outcome, Some(report), None)
            }
            // a failure after the user cancelled is still their abort
            Err(e) if self.shared.cancelled_in().is_some() => {
                error!(scan = %self.shared.name, error = %e, "cancelled scan did not stop cleanly");
                self.finish(ScanOutcome::Aborted, None, Some(e.to_string()))
            }
            Err(e) => {
                error!(scan = %self.shared.name, error = %e, "scan failed");
                self.finish(ScanOutcome::FatalError, None, Some(e.to_string()))
            }
        })
    }

    /// Root SCAN event plus one event per target.
    fn seed(&self, dispatcher: &mut Dispatcher, targets: &[String]) {
        let root = Event::seed(
            EventKind::Scan,
            serde_json::json!({ "name": self.shared.name, "targets": targets }),
            MODULE_SCAN,
        );
        let seeds: Vec<Event> = targets
            .iter()
            .map(|t| Event::derived(EventKind::classify(t), t.as_str(), &root, MODULE_SCAN).with_tag("target"))
            .collect();

        dispatcher.submit(root);
        for event in seeds {
            if self.shared.cancel.is_cancelled() {
                info!("cancelled while seeding, remaining targets skipped");
                break;
            }
            dispatcher.submit(event);
        }
    }

    fn finish(
        &mut self,
        outcome: ScanOutcome,
        dispatch: Option<DispatchReport>,
        error: Option<String>,
    ) -> ScanReport {
        let phase = if error.is_some() {
            ScanPhase::Failed
        } else {
            ScanPhase::Finished
        };
        self.teardown();
        self.shared.set_phase(phase);
        metrics::counter!(m::SCANS_COMPLETED_TOTAL, m::LABEL_OUTCOME => outcome.as_str()).increment(1);

        let cancelled_in = self.shared.cancelled_in();
        match cancelled_in {
            Some(phase) => info!(scan = %self.shared.name, cancelled_in = %phase, %outcome, "scan ended"),
            None => info!(scan = %self.shared.name, %outcome, "scan ended"),
        }

        ScanReport {
            name: self.shared.name.clone(),
            outcome,
            phase,
            cancelled_in,
            home: self.shared.home.clone(),
            dispatch,
            error,
        }
    }

    /// Best-effort cleanup. Runs once; never fails.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.shared.teardowns.fetch_add(1, Ordering::SeqCst);
        self.session_token.cancel();

        if !self.home_ready {
            return;
        }
        let home = self.shared.home.clone();

        if self.dispatched {
            if let Some(cloud) = self.word_cloud.as_ref().filter(|c| !c.is_empty()) {
                match cloud.save(&home) {
                    Ok(path) => info!("Saved word cloud ({} words) to {}", cloud.len(), path.display()),
                    Err(e) => warn!(error = %e, "failed to save word cloud"),
                }
            }
        }

        remove_empty_subdirs(&home);
        match std::fs::remove_dir(&home) {
            Ok(()) => debug!(home = %home.display(), "removed empty scan home"),
            Err(e) if is_dir_not_empty(&e) => {
                info!(home = %home.display(), "scan output kept");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(home = %home.display(), error = %e, "failed to clean up scan home"),
        }
    }
}

impl Drop for ScanLifecycle {
    fn drop(&mut self) {
        if !self.torn_down {
            self.teardown();
            if !self.phase().is_terminal() {
                self.shared.set_phase(ScanPhase::Finished);
            }
        }
    }
}

impl fmt::Debug for ScanLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanLifecycle")
            .field("name", &self.shared.name)
            .field("phase", &self.phase())
            .field("home", &self.shared.home)
            .finish()
    }
}

fn remove_empty_subdirs(home: &Path) {
    let Ok(entries) = std::fs::read_dir(home) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            // Fails harmlessly when the module left files behind.
            let _ = std::fs::remove_dir(&path);
        }
    }
}

fn is_dir_not_empty(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::DirectoryNotEmpty
}

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "clever", "dusty", "eager", "fuzzy", "gentle", "hidden", "icy", "jolly",
    "keen", "lucky", "mellow", "nimble", "odd", "proud", "quiet", "rusty", "silent", "tidy",
    "vivid", "wild", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "comet", "dragon", "falcon", "gecko", "harbor", "island", "jaguar", "kraken",
    "lantern", "meadow", "nebula", "otter", "pepper", "quartz", "raven", "sparrow", "tundra",
    "urchin", "walrus", "yak", "zephyr",
];

/// `adjective_noun`, e.g. `nimble_otter`.
pub fn random_scan_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("unnamed");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("scan");
    format!("{adjective}_{noun}")
}
