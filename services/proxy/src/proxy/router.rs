//! Route table and backend lookup.
//!
//! The table maps a host key (an exact host name or the wildcard) to a
//! path map, and a path map maps a path prefix to a backend descriptor.
//! Lookup falls back in a fixed order:
//!
//! 1. exact host, longest non-empty prefix
//! 2. wildcard host, longest non-empty prefix
//! 3. exact host, default (empty-prefix) entry
//! 4. wildcard host, default entry
//!
//! The wildcard never shadows an exact host. Longest-prefix is a linear
//! scan over keys in descending lexicographic order; route counts per
//! host are small enough that a trie is not worth it.
//!
//! The table is written by a single task (the discovery reducer) and read
//! concurrently by every connection task. Updates are atomic pointer
//! swaps, so a reader always sees a complete snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

/// Top-level lookup key: a literal host name or the wildcard.
///
/// Host names are matched case-sensitively, exactly as received in the
/// `Host` header (with any `:port` suffix already stripped).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostKey {
    Exact(String),
    Wildcard,
}

impl HostKey {
    pub fn exact(host: impl Into<String>) -> Self {
        Self::Exact(host.into())
    }
}

/// Resolved address a matched route points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// A container (or locally forwarded) address. `ip` is `None` when
    /// address resolution failed; such a route exists but behaves as
    /// no-route at lookup time.
    Direct { ip: Option<String>, port: u16 },
    /// An absolute external origin. Decoded from the port-`0` sentinel
    /// encoding, where the address half holds `scheme://host`.
    External { tls: bool, host: String },
}

impl Backend {
    /// Build a backend from an address and a declared port.
    ///
    /// Port `0` selects the scheme-qualified encoding: the address is
    /// reinterpreted as `scheme://host`, with `https` implying an
    /// outbound TLS connection on 443 and anything else plain TCP on 80.
    pub fn from_parts(ip: Option<String>, port: u16) -> Self {
        match (ip, port) {
            (Some(addr), 0) => {
                if let Some(host) = addr.strip_prefix("https://") {
                    Self::External {
                        tls: true,
                        host: host.to_string(),
                    }
                } else {
                    let host = addr.strip_prefix("http://").unwrap_or(&addr);
                    Self::External {
                        tls: false,
                        host: host.to_string(),
                    }
                }
            }
            (ip, port) => Self::Direct { ip, port },
        }
    }

    /// Whether a connection can actually be opened to this backend.
    pub fn is_resolvable(&self) -> bool {
        !matches!(self, Self::Direct { ip: None, .. })
    }

    /// Outbound port for this backend.
    pub fn port(&self) -> u16 {
        match self {
            Self::Direct { port, .. } => *port,
            Self::External { tls: true, .. } => 443,
            Self::External { tls: false, .. } => 80,
        }
    }
}

/// Normalize a request path or route prefix for matching.
///
/// Leading and trailing slashes are stripped; the root path becomes the
/// empty string (the default-route key).
pub fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// Strip an optional `:port` suffix from a `Host` header value.
pub fn strip_host_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

type PathMap = BTreeMap<String, Backend>;

/// Immutable snapshot of the routing state for lock-free reads.
#[derive(Debug, Default)]
struct RouteSnapshot {
    hosts: HashMap<HostKey, PathMap>,
}

impl RouteSnapshot {
    fn with_put(&self, host: HostKey, prefix: &str, backend: Backend) -> Self {
        let mut hosts = self.hosts.clone();
        hosts
            .entry(host)
            .or_default()
            .insert(normalize_path(prefix).to_string(), backend);
        Self { hosts }
    }

    fn without(&self, host: &HostKey, prefix: &str) -> Self {
        let mut hosts = self.hosts.clone();
        if let Some(paths) = hosts.get_mut(host) {
            paths.remove(normalize_path(prefix));
            // No empty path map may linger.
            if paths.is_empty() {
                hosts.remove(host);
            }
        }
        Self { hosts }
    }

    /// Longest non-empty prefix match: scan keys in descending
    /// lexicographic order and take the first that prefixes `path`.
    fn longest_prefix<'a>(paths: &'a PathMap, path: &str) -> Option<&'a Backend> {
        paths
            .iter()
            .rev()
            .find(|(prefix, _)| !prefix.is_empty() && path.starts_with(prefix.as_str()))
            .map(|(_, backend)| backend)
    }

    fn default_entry<'a>(&'a self, host: &HostKey) -> Option<&'a Backend> {
        self.hosts.get(host).and_then(|paths| paths.get(""))
    }

    fn route_count(&self) -> usize {
        self.hosts.values().map(|paths| paths.len()).sum()
    }
}

/// Routing table shared between the discovery reducer (sole writer) and
/// connection tasks (concurrent readers).
///
/// Uses ArcSwap in the clone-and-swap style: the writer builds a new
/// snapshot and publishes it in a single atomic store, so no reader ever
/// observes a half-mutated path map.
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    /// Create a new empty route table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    /// Insert or overwrite a route. The path map for `host` is created
    /// if absent.
    pub fn put(&self, host: HostKey, prefix: &str, backend: Backend) {
        let current = self.snapshot.load();
        let next = current.with_put(host.clone(), prefix, backend.clone());
        self.snapshot.store(Arc::new(next));
        debug!(host = ?host, prefix = %normalize_path(prefix), backend = ?backend, "route put");
    }

    /// Remove a single route. Removing the last entry of a path map
    /// removes the host entry itself. Removing an absent route is a
    /// no-op; the reducer may see duplicate removal events.
    pub fn remove(&self, host: &HostKey, prefix: &str) {
        let current = self.snapshot.load();
        let next = current.without(host, prefix);
        self.snapshot.store(Arc::new(next));
        debug!(host = ?host, prefix = %normalize_path(prefix), "route removed");
    }

    /// Resolve a backend for a request, applying the fallback order
    /// documented on this module. `host` is the raw `Host` header value,
    /// `path` the raw request path.
    pub fn lookup(&self, host: &str, path: &str) -> Option<Backend> {
        let snapshot = self.snapshot.load();
        let path = normalize_path(path);
        let host_key = HostKey::exact(strip_host_port(host));

        if let Some(paths) = snapshot.hosts.get(&host_key) {
            if let Some(backend) = RouteSnapshot::longest_prefix(paths, path) {
                return Some(backend.clone());
            }
        }

        if let Some(paths) = snapshot.hosts.get(&HostKey::Wildcard) {
            if let Some(backend) = RouteSnapshot::longest_prefix(paths, path) {
                return Some(backend.clone());
            }
        }

        if let Some(backend) = snapshot.default_entry(&host_key) {
            return Some(backend.clone());
        }

        snapshot.default_entry(&HostKey::Wildcard).cloned()
    }

    /// Total number of routes across all hosts.
    pub fn len(&self) -> usize {
        self.snapshot.load().route_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;
