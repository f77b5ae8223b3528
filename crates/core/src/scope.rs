//! Scope predicate used to gate `in_scope_only` modules.

use std::collections::BTreeSet;

use crate::config::ScopeConfig;
use crate::event::{Event, host_of};

/// Decides whether an event may be acted on.
///
/// Closures `Fn(&Event) -> bool` implement this, which is handy in tests.
pub trait ScopeFilter: Send + Sync {
    fn in_scope(&self, event: &Event) -> bool;
}

impl<F> ScopeFilter for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn in_scope(&self, event: &Event) -> bool {
        self(event)
    }
}

/// Host-based scope built from `[scope]`.
///
/// A host is in scope when it equals a target host or, unless `strict`, is a
/// subdomain of one. The blacklist wins over targets. Events without a host
/// (e.g. `SCAN`) are in scope.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    targets: Vec<String>,
    hosts: BTreeSet<String>,
    blacklist: BTreeSet<String>,
    strict: bool,
}

impl Scope {
    pub fn from_config(config: &ScopeConfig) -> Self {
        let hosts = config.targets.iter().filter_map(|t| host_of(t)).collect();
        let blacklist = config.blacklist.iter().filter_map(|t| host_of(t)).collect();
        Self {
            targets: config.targets.clone(),
            hosts,
            blacklist,
            strict: config.strict,
        }
    }

    /// Raw target strings, as configured.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn is_blacklisted(&self, host: &str) -> bool {
        self.blacklist.iter().any(|b| matches_domain(host, b))
    }

    pub fn host_in_scope(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if self.is_blacklisted(&host) {
            return false;
        }
        if self.strict {
            self.hosts.contains(&host)
        } else {
            self.hosts.iter().any(|t| matches_domain(&host, t))
        }
    }
}

impl ScopeFilter for Scope {
    fn in_scope(&self, event: &Event) -> bool {
        match event.host() {
            Some(host) => self.host_in_scope(&host),
            None => true,
        }
    }
}

fn matches_domain(host: &str, parent: &str) -> bool {
    host == parent
        || host
            .strip_suffix(parent)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
