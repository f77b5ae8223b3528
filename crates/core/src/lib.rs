#![doc = include_str!("../README.md")]

pub mod config;
pub mod deps;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod metrics;
pub mod module;
pub mod process;
pub mod scope;
pub mod wordcloud;

// --- re-exports ---

// errors
pub use error::{
    ConfigError, DependencyError, DispatchError, LaunchError, ModuleError, PresetError, ReconError,
};

// config
pub use config::{ModuleEntry, ReconConfig};

// events
pub use event::{Event, EventKind, MODULE_SCAN};

// module contract
pub use module::{
    BoxFuture, DynModule, Module, ModuleCatalog, ModuleContext, ModuleDescriptor, ModuleRegistry,
    SetupContext, ToolCheck, ToolDependency,
};

// execution
pub use dispatcher::{DispatchReport, Dispatcher, ModuleFailure, ScanDirs};
pub use lifecycle::{ScanHandle, ScanLifecycle, ScanOutcome, ScanPhase, ScanReport, ScanStatus};
pub use process::{ProcessSession, ProcessStreamer};
pub use scope::{Scope, ScopeFilter};
