//! HTTP request smuggling checks via [defparam/smuggler].
//!
//! Runs `smuggler.py` against every in-scope URL and turns each
//! `Issue Found: <technique> - <description>` line into a FINDING.
//!
//! [defparam/smuggler]: https://github.com/defparam/smuggler

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use reconhive_core::config::ModuleEntry;
use reconhive_core::error::ModuleError;
use reconhive_core::event::{Event, EventKind};
use reconhive_core::module::{
    FLAG_ACTIVE, FLAG_AGGRESSIVE, Module, ModuleContext, ModuleDescriptor, SetupContext,
    ToolDependency,
};
use tracing::{debug, warn};

pub const NAME: &str = "smuggler";

const REPO: &str = "https://github.com/defparam/smuggler.git";
const SCRIPT: &str = "smuggler/smuggler.py";
const DEFAULT_PYTHON: &str = "python3";

static ISSUE_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Issue Found:\s*(?P<technique>[^\s-][^-]*?)\s*-\s*(?P<description>.*?)\s*$")
        .expect("issue regex should compile")
});

/// One parsed `Issue Found` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub technique: String,
    pub description: String,
}

impl Issue {
    /// FINDING description, e.g. `[HTTP SMUGGLER] [TE] CL.TE desync`.
    pub fn summary(&self) -> String {
        if self.description.is_empty() {
            format!("[HTTP SMUGGLER] [{}]", self.technique)
        } else {
            format!("[HTTP SMUGGLER] [{}] {}", self.technique, self.description)
        }
    }
}

/// Parses a line of smuggler output. Anything that is not an issue report
/// yields `None`.
pub fn parse_issue_line(line: &str) -> Option<Issue> {
    let caps = ISSUE_FOUND.captures(line)?;
    let technique = caps.name("technique")?.as_str().trim();
    if technique.is_empty() {
        return None;
    }
    Some(Issue {
        technique: technique.to_owned(),
        description: caps
            .name("description")
            .map(|d| d.as_str().trim().to_owned())
            .unwrap_or_default(),
    })
}

pub fn descriptor() -> ModuleDescriptor {
    ModuleDescriptor::new(NAME)
        .description("Check URLs for HTTP request smuggling")
        .watches([EventKind::Url])
        .produces([EventKind::Finding])
        .flags([FLAG_ACTIVE, FLAG_AGGRESSIVE])
        .in_scope_only(true)
        .dependency(
            ToolDependency::tools_path(NAME, SCRIPT).install_with([
                "git",
                "clone",
                "--depth",
                "1",
                REPO,
                "{tools_dir}/smuggler",
            ]),
        )
}

#[derive(Debug)]
pub struct Smuggler {
    descriptor: ModuleDescriptor,
    python: String,
    /// (url, technique) pairs already reported in this scan
    reported: Mutex<HashSet<(String, String)>>,
}

impl Default for Smuggler {
    fn default() -> Self {
        Self::with_python(DEFAULT_PYTHON)
    }
}

impl Smuggler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `python` to run the script instead of `python3`.
    pub fn with_python(python: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor(),
            python: python.into(),
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Builds the module from its preset entry.
    ///
    /// Options: `python` (string).
    pub fn from_entry(entry: &ModuleEntry) -> Result<Self, ModuleError> {
        match entry.options.get("python") {
            None => Ok(Self::new()),
            Some(value) => value
                .as_str()
                .filter(|s| !s.trim().is_empty())
                .map(Self::with_python)
                .ok_or_else(|| {
                    ModuleError::Handler("option 'python' must be a non-empty string".to_owned())
                }),
        }
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    pub fn command(&self, tools_dir: &Path, url: &str) -> Vec<String> {
        vec![
            self.python.clone(),
            tools_dir.join(SCRIPT).display().to_string(),
            "--no-color".to_owned(),
            "-q".to_owned(),
            "-u".to_owned(),
            url.to_owned(),
        ]
    }

    /// `true` the first time a (url, technique) pair is seen.
    fn first_report(&self, url: &str, technique: &str) -> bool {
        self.reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((url.to_owned(), technique.to_owned()))
    }
}

impl Module for Smuggler {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn setup(&mut self, _ctx: &SetupContext) -> Result<(), ModuleError> {
        if which::which(&self.python).is_err() {
            return Err(ModuleError::Handler(format!(
                "python interpreter '{}' not found",
                self.python
            )));
        }
        Ok(())
    }

    async fn handle_event(&self, event: Arc<Event>, ctx: ModuleContext) -> Result<(), ModuleError> {
        let Some(url) = event.data_str() else {
            warn!(module = NAME, event = %event, "URL event without a string payload");
            return Ok(());
        };

        let command = self.command(ctx.tools_dir(), url);
        let mut session = match ctx.streamer().start(&command) {
            Ok(session) => session,
            Err(e) => {
                warn!(module = NAME, url, error = %e, "failed to start smuggler");
                return Ok(());
            }
        };

        let mut emitted = 0usize;
        while let Some(line) = session.next_line().await {
            let Some(issue) = parse_issue_line(&line) else {
                continue;
            };
            if !self.first_report(url, &issue.technique) {
                debug!(module = NAME, url, technique = %issue.technique, "duplicate issue skipped");
                continue;
            }
            let data = serde_json::json!({
                "host": event.host(),
                "url": url,
                "technique": issue.technique,
                "description": issue.summary(),
            });
            ctx.emit_derived(EventKind::Finding, data, &event)?;
            emitted += 1;
        }

        match session.wait().await {
            Ok(status) if !status.success() && !ctx.is_cancelled() => {
                warn!(module = NAME, url, %status, emitted, "smuggler exited unsuccessfully");
            }
            Ok(_) => debug!(module = NAME, url, emitted, "smuggler finished"),
            Err(e) => warn!(module = NAME, url, error = %e, "lost smuggler exit status"),
        }
        Ok(())
    }
}
