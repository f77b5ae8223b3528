//! Events: the unit of communication between modules.
//!
//! An [`Event`] is immutable once built. Its `source` is the id of the event
//! that caused it, never an owning pointer, so dropping a parent never
//! depends on its children. A derived event can only be constructed from an
//! existing [`Event`], which keeps every provenance chain acyclic and rooted
//! at a seed.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use url::{Host, Url};
use uuid::Uuid;

/// Name used as `module` for events created by the lifecycle itself.
pub const MODULE_SCAN: &str = "scan";

// ─── EventKind ───────────────────────────────────────────────────────

/// Event kinds routed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Root event of a scan
    Scan,
    /// Host name
    DnsName,
    /// IPv4 or IPv6 address
    IpAddress,
    /// `host:port` with an open TCP port
    OpenTcpPort,
    /// Absolute URL
    Url,
    /// Informational result for the operator
    Finding,
    /// Result with a severity
    Vulnerability,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 7] = [
        Self::Scan,
        Self::DnsName,
        Self::IpAddress,
        Self::OpenTcpPort,
        Self::Url,
        Self::Finding,
        Self::Vulnerability,
    ];

    /// Wire name, e.g. `"DNS_NAME"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "SCAN",
            Self::DnsName => "DNS_NAME",
            Self::IpAddress => "IP_ADDRESS",
            Self::OpenTcpPort => "OPEN_TCP_PORT",
            Self::Url => "URL",
            Self::Finding => "FINDING",
            Self::Vulnerability => "VULNERABILITY",
        }
    }

    /// Whether this kind is reported to the operator as a result.
    pub fn is_result(&self) -> bool {
        matches!(self, Self::Finding | Self::Vulnerability)
    }

    /// Guess the kind of a raw target string.
    ///
    /// `https://a.b/` is a URL, `10.0.0.1` an IP address, `a.b:8443` an open
    /// port, anything else a DNS name.
    pub fn classify(target: &str) -> Self {
        let target = target.trim();
        if target.contains("://") {
            return Self::Url;
        }
        if target.parse::<IpAddr>().is_ok() {
            return Self::IpAddress;
        }
        if let Some((host, port)) = target.rsplit_once(':') {
            if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() {
                return Self::OpenTcpPort;
            }
        }
        Self::DnsName
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == upper)
            .ok_or_else(|| format!("unknown event kind: {s}"))
    }
}

// ─── Event ───────────────────────────────────────────────────────────

/// Immutable typed record passed between modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,
    kind: EventKind,
    data: serde_json::Value,
    source: Option<Uuid>,
    module: String,
    depth: u32,
    tags: BTreeSet<String>,
    timestamp: SystemTime,
}

impl Event {
    /// Root event with no source.
    pub fn seed(kind: EventKind, data: impl Into<serde_json::Value>, module: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            data: data.into(),
            source: None,
            module: module.into(),
            depth: 0,
            tags: BTreeSet::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Event caused by `source`.
    pub fn derived(
        kind: EventKind,
        data: impl Into<serde_json::Value>,
        source: &Event,
        module: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            data: data.into(),
            source: Some(source.id),
            module: module.into(),
            depth: source.depth.saturating_add(1),
            tags: BTreeSet::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Adds a tag. Only usable before the event is submitted.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Payload as a string, for kinds whose data is a plain string.
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_str()
    }

    /// Id of the causing event, `None` for roots.
    pub fn source(&self) -> Option<Uuid> {
        self.source
    }

    /// Name of the module (or `"scan"`) that built this event.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Number of ancestors.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Host this event refers to, lowercased.
    ///
    /// String payloads are parsed as URL / host / `host:port`; object
    /// payloads use their `"host"` field, falling back to `"url"`.
    pub fn host(&self) -> Option<String> {
        match &self.data {
            serde_json::Value::String(s) => host_of(s),
            serde_json::Value::Object(map) => map
                .get("host")
                .and_then(|v| v.as_str())
                .or_else(|| map.get("url").and_then(|v| v.as_str()))
                .and_then(host_of),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.simple().to_string();
        match &self.data {
            serde_json::Value::String(s) => write!(f, "{}[{}] {}", self.kind, &id[..8], s),
            other => write!(f, "{}[{}] {}", self.kind, &id[..8], other),
        }
    }
}

/// Extracts the host of a URL, `host:port`, `[v6]:port` or bare host.
///
/// URLs go through the WHATWG parser, so hosts come back lowercased,
/// percent-decoded and IDNA-encoded the way an HTTP client would see them.
pub fn host_of(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let url = if raw.contains("://") {
        Url::parse(raw).ok()?
    } else if let Ok(ip) = raw.parse::<IpAddr>() {
        // bare IPv6 would otherwise read as host:port
        return Some(ip.to_string());
    } else {
        Url::parse(&format!("http://{raw}")).ok()?
    };
    normalized_host(&url)
}

/// Lowercased host without the trailing root dot.
pub fn normalized_host(url: &Url) -> Option<String> {
    let host = match url.host()? {
        Host::Domain(domain) => domain.trim_end_matches('.').to_ascii_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };
    (!host.is_empty()).then_some(host)
}

// ─── Provenance ──────────────────────────────────────────────────────

/// Child → parent index of every event submitted to one scan.
#[derive(Debug, Default)]
pub struct Provenance {
    parents: HashMap<Uuid, Option<Uuid>>,
}

impl Provenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &Event) {
        self.parents.insert(event.id, event.source);
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Ids from `id` up to its root, `id` first.
    ///
    /// Bounded by the number of recorded events; a chain that leaves the
    /// recorded set ends at the last known id.
    pub fn chain(&self, id: Uuid) -> Vec<Uuid> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(Some(parent)) = self.parents.get(&current) {
            if chain.len() > self.parents.len() {
                break;
            }
            chain.push(*parent);
            current = *parent;
        }
        chain
    }
}
