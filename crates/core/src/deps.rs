//! External tool dependencies.
//!
//! Checked during `prepare`, before the scan home exists. Missing tools are
//! installed only when `deps.install` is enabled.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::DependencyError;
use crate::module::{BoxFuture, ToolCheck, ToolDependency};

/// Makes sure a tool is available.
pub trait DependencyInstaller: Send + Sync {
    fn ensure<'a>(&'a self, dep: &'a ToolDependency) -> BoxFuture<'a, Result<(), DependencyError>>;
}

/// Checks `PATH` and the tools directory, running install commands through
/// the shell-free argv form.
#[derive(Debug, Clone)]
pub struct SystemInstaller {
    tools_dir: PathBuf,
    install: bool,
}

impl SystemInstaller {
    pub fn new(tools_dir: impl Into<PathBuf>, install: bool) -> Self {
        Self {
            tools_dir: tools_dir.into(),
            install,
        }
    }

    pub fn tools_dir(&self) -> &Path {
        &self.tools_dir
    }

    /// Whether `dep` is usable right now.
    pub fn is_available(&self, dep: &ToolDependency) -> bool {
        match &dep.check {
            ToolCheck::Executable(name) => which::which(name).is_ok(),
            ToolCheck::ToolsPath(rel) => self.tools_dir.join(rel).exists(),
        }
    }

    async fn install(&self, dep: &ToolDependency) -> Result<(), DependencyError> {
        let command = dep.install_command(&self.tools_dir);
        let Some((program, args)) = command.split_first() else {
            return Err(DependencyError::Missing {
                tool: dep.name.clone(),
            });
        };

        tokio::fs::create_dir_all(&self.tools_dir)
            .await
            .map_err(|e| DependencyError::InstallFailed {
                tool: dep.name.clone(),
                reason: format!("cannot create {}: {e}", self.tools_dir.display()),
            })?;

        info!(tool = %dep.name, command = %command.join(" "), "installing dependency");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DependencyError::InstallFailed {
                tool: dep.name.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DependencyError::InstallFailed {
                tool: dep.name.clone(),
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        if !self.is_available(dep) {
            return Err(DependencyError::InstallFailed {
                tool: dep.name.clone(),
                reason: "install command succeeded but the tool is still missing".to_owned(),
            });
        }
        Ok(())
    }
}

impl DependencyInstaller for SystemInstaller {
    fn ensure<'a>(&'a self, dep: &'a ToolDependency) -> BoxFuture<'a, Result<(), DependencyError>> {
        Box::pin(async move {
            if self.is_available(dep) {
                debug!(tool = %dep.name, "dependency present");
                return Ok(());
            }
            if !self.install {
                return Err(DependencyError::Missing {
                    tool: dep.name.clone(),
                });
            }
            self.install(dep).await
        })
    }
}
