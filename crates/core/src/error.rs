//! Error types, one enum per concern.
//!
//! Only [`PresetError`] (during `prepare`) and [`DispatchError`] abort a scan.
//! [`LaunchError`] and [`ModuleError`] are isolated per module invocation and
//! logged by the dispatcher.

use crate::event::EventKind;

/// Top-level reconhive error.
#[derive(Debug, thiserror::Error)]
pub enum ReconError {
    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Preset validation or preparation error
    #[error("preset error: {0}")]
    Preset(#[from] PresetError),

    /// External process launch error
    #[error("launch error: {0}")]
    Launch(#[from] LaunchError),

    /// Module handler error
    #[error("module error: {0}")]
    Module(#[from] ModuleError),

    /// Dispatcher invariant violation
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Tool dependency error
    #[error("dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// Config file could not be parsed
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A config value is out of range or malformed
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Invalid or unsafe scan preset. Fatal to preparation only.
#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    /// No module left to run
    #[error("no modules enabled")]
    EmptyModuleSet,

    /// Preset names a module the catalog does not know
    #[error("unknown module: {name}")]
    UnknownModule { name: String },

    /// The same module appears twice
    #[error("module already registered: {name}")]
    DuplicateModule { name: String },

    /// Name is reserved for events the scan itself emits
    #[error("module name '{name}' is reserved")]
    ReservedModuleName { name: String },

    /// Only deadly modules were enabled and `allow_deadly` is off
    #[error("deadly modules require allow_deadly: {}", modules.join(", "))]
    DeadlyNotAllowed { modules: Vec<String> },

    /// Scan has no targets
    #[error("scope has no targets")]
    MissingScope,

    /// A module's external tool is unavailable
    #[error("module '{module}' is missing dependency: {source}")]
    MissingDependency {
        module: String,
        #[source]
        source: DependencyError,
    },

    /// Module construction or setup failed
    #[error("module '{module}' setup failed: {reason}")]
    SetupFailed { module: String, reason: String },

    /// Scan home directory could not be created
    #[error("failed to create scan home {path}: {source}")]
    HomeDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// `cancel` was called before preparation finished
    #[error("scan cancelled during preparation")]
    Cancelled,

    /// Lifecycle operation called in the wrong phase
    #[error("cannot {operation} while scan is {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: String,
    },
}

/// External tool could not be started.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Command vector was empty
    #[error("empty command")]
    EmptyCommand,

    /// Executable not found
    #[error("executable not found: {program}")]
    NotFound { program: String },

    /// Spawning failed for another reason
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Scan is cancelling, no new sessions are started
    #[error("scan cancelled, refusing to start {program}")]
    Cancelled { program: String },

    /// Exit status was lost (reaper task gone)
    #[error("failed to wait for {program}: {reason}")]
    Wait { program: String, reason: String },
}

/// Error raised while a module handles an event.
///
/// The dispatcher logs it, records a module failure and moves on.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// The module's tool could not be launched
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The module emitted a kind missing from its `produced_kinds`
    #[error("module '{module}' emitted undeclared event kind {kind}")]
    UndeclaredKind { module: String, kind: EventKind },

    /// The scan stopped accepting events
    #[error("scan is closed, event dropped")]
    ScanClosed,

    /// Module-specific failure
    #[error("{0}")]
    Handler(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Unrecoverable dispatcher condition. Moves the scan to `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// In-flight accounting went negative
    #[error("in-flight counter underflow for event {event_id}")]
    InFlightUnderflow { event_id: String },

    /// In-flight work did not drain after cancellation
    #[error("drain did not finish within {secs}s, {remaining} events still in flight")]
    DrainTimeout { secs: u64, remaining: usize },

    /// A handler task vanished without reporting back
    #[error("handler task lost: {reason}")]
    HandlerLost { reason: String },
}

/// Tool dependency errors.
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    /// Tool is missing and installation was not requested
    #[error("{tool} is not installed (enable deps.install to install it)")]
    Missing { tool: String },

    /// Install command failed
    #[error("failed to install {tool}: {reason}")]
    InstallFailed { tool: String, reason: String },
}
