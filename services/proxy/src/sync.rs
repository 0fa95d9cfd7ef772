//! Discovery reducer.
//!
//! Folds the container snapshot and the lifecycle-event stream into
//! route table mutations. Events are processed one at a time, strictly
//! in stream order: whether a container's start lands before or after
//! its death decides the final route state, so nothing here batches or
//! reorders.
//!
//! Local overrides are statically configured routes (typically ports
//! forwarded from the proxy host itself). They are reapplied after
//! every mutation so no container event can evict them.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use dockgate_events::{ContainerEvent, ContainerSummary, EventKind};

use crate::discovery::DiscoveryProvider;
use crate::proxy::expose::parse_expose;
use crate::proxy::router::{Backend, SharedRouteTable};

/// A statically configured route that must survive discovery churn.
#[derive(Debug, Clone)]
pub struct LocalOverride {
    /// Exposure annotation declaring the routes.
    pub annotation: String,
    /// Address the routes point at (the proxy host itself, or an
    /// absolute `scheme://host` origin with port `0`).
    pub address: String,
}

/// The sole writer of the route table.
pub struct Reducer {
    table: SharedRouteTable,
    overrides: Vec<LocalOverride>,
}

impl Reducer {
    pub fn new(table: SharedRouteTable, overrides: Vec<LocalOverride>) -> Self {
        Self { table, overrides }
    }

    /// Apply the local overrides before any discovery data arrives, so
    /// the proxy can serve statically configured routes immediately.
    pub fn seed_overrides(&self) {
        self.reapply_overrides();
    }

    /// Fold the startup snapshot into the table.
    pub fn apply_snapshot(&self, containers: Vec<ContainerSummary>) {
        for container in &containers {
            if container.is_routable() {
                self.put_container(container);
            }
        }
        self.reapply_overrides();

        info!(
            container_count = containers.len(),
            route_count = self.table.len(),
            "Initial container snapshot applied"
        );
    }

    /// Apply a single lifecycle event. Containers without the exposure
    /// annotation, one-off containers, and non-lifecycle kinds are all
    /// ignored.
    pub fn apply_event(&self, event: &ContainerEvent) {
        if !event.container.is_routable() {
            return;
        }

        match event.kind {
            EventKind::Start => self.put_container(&event.container),
            EventKind::Die => self.remove_container(&event.container),
            EventKind::Other => return,
        }
        self.reapply_overrides();
    }

    fn put_container(&self, container: &ContainerSummary) {
        let Some(annotation) = &container.expose else {
            return;
        };

        let decls = match parse_expose(annotation) {
            Ok(decls) => decls,
            Err(e) => {
                // Fatal for this declaration only; the stream goes on.
                warn!(container = %container.id, error = %e, "Invalid exposure annotation");
                return;
            }
        };

        let ip = container.resolve_ip().map(str::to_string);
        if ip.is_none() {
            // Keep the routes: an unreachable backend should answer 503
            // explicitly, not vanish from the table.
            warn!(container = %container.id, "No resolvable address; routes degrade to 503");
        }

        for decl in decls {
            self.table
                .put(decl.host, &decl.path, Backend::from_parts(ip.clone(), decl.port));
        }
        debug!(container = %container.id, "Container routes added");
    }

    fn remove_container(&self, container: &ContainerSummary) {
        let Some(annotation) = &container.expose else {
            return;
        };

        let decls = match parse_expose(annotation) {
            Ok(decls) => decls,
            Err(e) => {
                warn!(container = %container.id, error = %e, "Invalid exposure annotation");
                return;
            }
        };

        // Removal is idempotent; a duplicate die event is a no-op.
        for decl in decls {
            self.table.remove(&decl.host, &decl.path);
        }
        debug!(container = %container.id, "Container routes removed");
    }

    fn reapply_overrides(&self) {
        for over in &self.overrides {
            let decls = match parse_expose(&over.annotation) {
                Ok(decls) => decls,
                Err(e) => {
                    warn!(annotation = %over.annotation, error = %e, "Invalid local override");
                    continue;
                }
            };
            for decl in decls {
                self.table.put(
                    decl.host,
                    &decl.path,
                    Backend::from_parts(Some(over.address.clone()), decl.port),
                );
            }
        }
    }
}

/// Drive the reducer from a provider: snapshot once, then tail the
/// event stream forever. Provider failures are retried, never fatal.
pub async fn run_sync_loop<P: DiscoveryProvider>(
    mut provider: P,
    reducer: Reducer,
    retry_interval: Duration,
) -> Result<()> {
    loop {
        match provider.list_containers().await {
            Ok(containers) => {
                reducer.apply_snapshot(containers);
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to list containers; retrying");
                tokio::time::sleep(retry_interval).await;
            }
        }
    }

    loop {
        match provider.next_event().await {
            Ok(event) => reducer.apply_event(&event),
            Err(e) => {
                warn!(error = %e, "Event stream failed; retrying");
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::proxy::router::RouteTable;
    use dockgate_events::ContainerNetwork;

    fn container(id: &str, expose: &str, ip: Option<&str>) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            expose: Some(expose.to_string()),
            networks: ip
                .map(|ip| {
                    vec![ContainerNetwork {
                        name: "bridge".to_string(),
                        ip: ip.to_string(),
                    }]
                })
                .unwrap_or_default(),
            is_oneoff: false,
        }
    }

    fn start(container: ContainerSummary) -> ContainerEvent {
        ContainerEvent {
            kind: EventKind::Start,
            container,
        }
    }

    fn die(container: ContainerSummary) -> ContainerEvent {
        ContainerEvent {
            kind: EventKind::Die,
            container,
        }
    }

    #[test]
    fn test_start_then_die_round_trip() {
        let table = Arc::new(RouteTable::new());
        let reducer = Reducer::new(Arc::clone(&table), Vec::new());

        let c = container("c1", "svc.local/api=9000", Some("10.0.0.5"));
        reducer.apply_event(&start(c.clone()));
        assert_eq!(
            table.lookup("svc.local", "/api/v1"),
            Some(Backend::Direct {
                ip: Some("10.0.0.5".to_string()),
                port: 9000
            })
        );

        reducer.apply_event(&die(c.clone()));
        assert_eq!(table.lookup("svc.local", "/api/v1"), None);

        // Duplicate die events are tolerated.
        reducer.apply_event(&die(c));
        assert!(table.is_empty());
    }

    #[test]
    fn test_snapshot_folds_all_routable_containers() {
        let table = Arc::new(RouteTable::new());
        let reducer = Reducer::new(Arc::clone(&table), Vec::new());

        let mut oneoff = container("c3", "other.local=1000", Some("10.0.0.7"));
        oneoff.is_oneoff = true;

        let mut unlabeled = container("c4", "unused", Some("10.0.0.8"));
        unlabeled.expose = None;

        reducer.apply_snapshot(vec![
            container("c1", "a.local=8080", Some("10.0.0.5")),
            container("c2", "b.local/x=8081,/y=8082", Some("10.0.0.6")),
            oneoff,
            unlabeled,
        ]);

        assert_eq!(table.len(), 3);
        assert!(table.lookup("other.local", "/").is_none());
    }

    #[test]
    fn test_other_events_are_ignored() {
        let table = Arc::new(RouteTable::new());
        let reducer = Reducer::new(Arc::clone(&table), Vec::new());

        reducer.apply_event(&ContainerEvent {
            kind: EventKind::Other,
            container: container("c1", "svc.local=8080", Some("10.0.0.5")),
        });
        assert!(table.is_empty());
    }

    #[test]
    fn test_malformed_annotation_is_contained() {
        let table = Arc::new(RouteTable::new());
        let reducer = Reducer::new(Arc::clone(&table), Vec::new());

        reducer.apply_event(&start(container("bad", "no-equals-here", Some("10.0.0.5"))));
        assert!(table.is_empty());

        // The reducer keeps working afterwards.
        reducer.apply_event(&start(container("good", "svc.local=8080", Some("10.0.0.6"))));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unresolved_address_still_writes_route() {
        let table = Arc::new(RouteTable::new());
        let reducer = Reducer::new(Arc::clone(&table), Vec::new());

        reducer.apply_event(&start(container("c1", "svc.local=8080", None)));

        let backend = table.lookup("svc.local", "/").unwrap();
        assert_eq!(backend, Backend::Direct { ip: None, port: 8080 });
        assert!(!backend.is_resolvable());
    }

    #[test]
    fn test_overrides_survive_conflicting_events() {
        let table = Arc::new(RouteTable::new());
        let overrides = vec![LocalOverride {
            annotation: "svc.local/api=9000".to_string(),
            address: "127.0.0.1".to_string(),
        }];
        let reducer = Reducer::new(Arc::clone(&table), overrides);
        reducer.seed_overrides();

        let local = Backend::Direct {
            ip: Some("127.0.0.1".to_string()),
            port: 9000,
        };
        assert_eq!(table.lookup("svc.local", "/api"), Some(local.clone()));

        // A container claims the identical route; the override wins
        // again after the event is processed.
        let c = container("c1", "svc.local/api=9100", Some("10.0.0.5"));
        reducer.apply_event(&start(c.clone()));
        assert_eq!(table.lookup("svc.local", "/api"), Some(local.clone()));

        // Its death cannot evict the override either.
        reducer.apply_event(&die(c));
        assert_eq!(table.lookup("svc.local", "/api"), Some(local));
    }

    #[test]
    fn test_external_override_uses_scheme_sentinel() {
        let table = Arc::new(RouteTable::new());
        let overrides = vec![LocalOverride {
            annotation: "docs.local=0".to_string(),
            address: "https://docs.example.org".to_string(),
        }];
        let reducer = Reducer::new(Arc::clone(&table), overrides);
        reducer.seed_overrides();

        assert_eq!(
            table.lookup("docs.local", "/guide"),
            Some(Backend::External {
                tls: true,
                host: "docs.example.org".to_string()
            })
        );
    }
}
