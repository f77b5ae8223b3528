//! Command-line definition (clap derive). No I/O happens here.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// reconhive -- modular recon scan orchestrator.
///
/// Use `reconhive <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "reconhive", version, about, long_about = None)]
pub struct Cli {
    /// Preset file. Without it `./reconhive.toml` is used when present.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scan.
    Scan(ScanArgs),

    /// List available modules.
    Modules(ModulesArgs),

    /// Manage third-party tool dependencies.
    Deps(DepsArgs),
}

// ---- scan ----

/// Command-line values win over the preset; boolean switches can only turn
/// an option on.
#[derive(Args, Debug, Default)]
pub struct ScanArgs {
    /// Targets to seed (hosts, IPs, host:port or URLs).
    #[arg(short, long, value_delimiter = ',', num_args = 1..)]
    pub targets: Vec<String>,

    /// Hosts never acted on, subdomains included.
    #[arg(short = 'b', long, value_delimiter = ',', num_args = 1..)]
    pub blacklist: Vec<String>,

    /// Only exact target hosts are in scope.
    #[arg(long)]
    pub strict_scope: bool,

    /// Modules to enable.
    #[arg(short, long, value_delimiter = ',', num_args = 1..)]
    pub modules: Vec<String>,

    /// Enable every module carrying one of these flags.
    #[arg(short, long, value_delimiter = ',', num_args = 1..)]
    pub flags: Vec<String>,

    /// Disable every module carrying one of these flags.
    #[arg(short = 'x', long, value_delimiter = ',', num_args = 1..)]
    pub exclude_flags: Vec<String>,

    /// Scan name (random when unset).
    #[arg(short, long)]
    pub name: Option<String>,

    /// Run modules flagged deadly.
    #[arg(long)]
    pub allow_deadly: bool,

    /// Prepare and validate only, dispatch nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Start without asking for confirmation.
    #[arg(short, long)]
    pub yes: bool,

    /// Install missing tool dependencies during preparation.
    #[arg(long)]
    pub install_deps: bool,

    /// Print the effective preset as TOML and exit.
    #[arg(long)]
    pub current_preset: bool,
}

// ---- modules ----

#[derive(Args, Debug, Default)]
pub struct ModulesArgs {
    /// Only modules carrying one of these flags.
    #[arg(short, long, value_delimiter = ',', num_args = 1..)]
    pub flags: Vec<String>,

    /// Hide modules carrying one of these flags.
    #[arg(short = 'x', long, value_delimiter = ',', num_args = 1..)]
    pub exclude_flags: Vec<String>,
}

// ---- deps ----

#[derive(Args, Debug)]
pub struct DepsArgs {
    #[command(subcommand)]
    pub action: DepsAction,
}

#[derive(Subcommand, Debug)]
pub enum DepsAction {
    /// Install tool dependencies of the given modules (all when omitted).
    Install {
        modules: Vec<String>,
    },
    /// Report which tool dependencies are present.
    Check {
        modules: Vec<String>,
    },
}
