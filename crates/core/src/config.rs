//! Scan configuration (the resolved preset).
//!
//! [`ReconConfig`] is the top-level structure of a `reconhive.toml` preset.
//!
//! # Precedence
//! 1. CLI arguments (applied by the caller)
//! 2. Environment variables (`RECONHIVE_SCAN_ALLOW_DEADLY=true`)
//! 3. Config file
//! 4. Defaults
//!
//! ```no_run
//! # async fn example() -> Result<(), reconhive_core::error::ReconError> {
//! use reconhive_core::config::ReconConfig;
//!
//! let config = ReconConfig::load("reconhive.toml").await?;
//! let config = ReconConfig::parse("[scope]\ntargets = [\"example.com\"]")?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, ReconError};

/// Full scan preset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub scan: ScanOptions,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub deps: DepsConfig,
    #[serde(default)]
    pub word_cloud: WordCloudConfig,
    /// Module entries, in the order they were enabled
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

impl ReconConfig {
    /// Reads a TOML file, applies environment overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ReconError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file without environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ReconError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReconError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                ReconError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parses a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, ReconError> {
        toml::from_str(toml_str).map_err(|e| {
            ReconError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Serializes the effective preset back to TOML.
    pub fn to_toml(&self) -> Result<String, ReconError> {
        toml::to_string_pretty(self).map_err(|e| {
            ReconError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Environment overrides, named `RECONHIVE_{SECTION}_{FIELD}`.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "RECONHIVE_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "RECONHIVE_GENERAL_LOG_FORMAT");
        override_path(&mut self.general.home_dir, "RECONHIVE_GENERAL_HOME_DIR");
        override_path(&mut self.general.tools_dir, "RECONHIVE_GENERAL_TOOLS_DIR");

        override_bool(&mut self.scan.allow_deadly, "RECONHIVE_SCAN_ALLOW_DEADLY");
        override_bool(&mut self.scan.dry_run, "RECONHIVE_SCAN_DRY_RUN");
        override_bool(&mut self.scan.yes, "RECONHIVE_SCAN_YES");
        override_u64(
            &mut self.scan.grace_period_secs,
            "RECONHIVE_SCAN_GRACE_PERIOD_SECS",
        );
        override_u64(
            &mut self.scan.drain_timeout_secs,
            "RECONHIVE_SCAN_DRAIN_TIMEOUT_SECS",
        );

        override_csv(&mut self.scope.targets, "RECONHIVE_SCOPE_TARGETS");
        override_csv(&mut self.scope.blacklist, "RECONHIVE_SCOPE_BLACKLIST");
        override_bool(&mut self.scope.strict, "RECONHIVE_SCOPE_STRICT");

        override_bool(&mut self.deps.install, "RECONHIVE_DEPS_INSTALL");
        override_bool(&mut self.word_cloud.enabled, "RECONHIVE_WORD_CLOUD_ENABLED");
    }

    /// Checks value ranges. Module names are resolved later, in `prepare`.
    pub fn validate(&self) -> Result<(), ReconError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            }
            .into());
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            }
            .into());
        }

        if self.scan.grace_period_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan.grace_period_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            }
            .into());
        }

        if self.scan.drain_timeout_secs < self.scan.grace_period_secs {
            return Err(ConfigError::InvalidValue {
                field: "scan.drain_timeout_secs".to_owned(),
                reason: "must not be shorter than scan.grace_period_secs".to_owned(),
            }
            .into());
        }

        if let Some(name) = &self.scan.name {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
                && name != "."
                && name != "..";
            if !valid {
                return Err(ConfigError::InvalidValue {
                    field: "scan.name".to_owned(),
                    reason: "only letters, digits, '_', '-' and '.' are allowed".to_owned(),
                }
                .into());
            }
        }

        for (idx, entry) in self.modules.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("modules[{idx}].name"),
                    reason: "must not be empty".to_owned(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Names of the enabled module entries.
    pub fn enabled_modules(&self) -> impl Iterator<Item = &ModuleEntry> {
        self.modules.iter().filter(|m| m.enabled)
    }
}

/// `[general]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// json, pretty
    pub log_format: String,
    /// Parent directory of per-scan home directories
    pub home_dir: PathBuf,
    /// Where third-party tools are installed
    pub tools_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
            home_dir: PathBuf::from(".reconhive/scans"),
            tools_dir: PathBuf::from(".reconhive/tools"),
        }
    }
}

/// `[scan]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Scan name; a random one is generated when unset
    pub name: Option<String>,
    /// Run modules flagged `deadly`
    pub allow_deadly: bool,
    /// Resolve and validate everything, dispatch nothing
    pub dry_run: bool,
    /// Skip the interactive confirmation
    pub yes: bool,
    /// Seconds between SIGTERM and SIGKILL for live tool sessions
    pub grace_period_secs: u64,
    /// Upper bound on draining in-flight events after cancellation
    pub drain_timeout_secs: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            name: None,
            allow_deadly: false,
            dry_run: false,
            yes: false,
            grace_period_secs: 5,
            drain_timeout_secs: 30,
        }
    }
}

/// `[scope]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Seed targets: hosts, IPs, `host:port` or URLs
    pub targets: Vec<String>,
    /// Hosts (and their subdomains) never acted on
    pub blacklist: Vec<String>,
    /// Exact host match only, subdomains of targets are out of scope
    pub strict: bool,
}

/// `[deps]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DepsConfig {
    /// Run install commands for missing tools
    pub install: bool,
}

/// `[word_cloud]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WordCloudConfig {
    pub enabled: bool,
    /// Word list merged in at preparation (`count<TAB>word` lines)
    pub load_path: Option<PathBuf>,
}

impl Default for WordCloudConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            load_path: None,
        }
    }
}

/// `[[modules]]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Free-form options handed to the module factory
    #[serde(default)]
    pub options: toml::Table,
}

impl ModuleEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            options: toml::Table::new(),
        }
    }

    /// String option, if present and a string.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }
}

fn default_true() -> bool {
    true
}

// --- env override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_path(target: &mut PathBuf, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = PathBuf::from(val);
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

fn override_csv(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
    }
}
