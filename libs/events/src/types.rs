//! Container metadata and lifecycle event types.

use serde::{Deserialize, Serialize};

/// Container label carrying the exposure annotation.
pub const EXPOSE_LABEL: &str = "dockgate.expose";

/// Compose label marking a container as a one-off run.
pub const ONEOFF_LABEL: &str = "com.docker.compose.oneoff";

/// Kind of a container lifecycle event.
///
/// Anything that is not a start or a clean death is `Other` and ignored
/// by the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Die,
    Other,
}

impl EventKind {
    /// Map a provider status string onto an event kind.
    pub fn from_status(status: &str) -> Self {
        match status {
            "start" => Self::Start,
            "die" => Self::Die,
            _ => Self::Other,
        }
    }
}

/// A network a container is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNetwork {
    /// Network name (e.g. `bridge`).
    pub name: String,
    /// IP address on that network; may be empty while the container is
    /// still being wired up.
    pub ip: String,
}

/// Provider-independent view of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    /// Provider container ID.
    pub id: String,
    /// Exposure annotation, if the container carries one.
    pub expose: Option<String>,
    /// Attached networks in the provider's iteration order.
    pub networks: Vec<ContainerNetwork>,
    /// One-off containers are excluded from routing.
    pub is_oneoff: bool,
}

impl ContainerSummary {
    /// Resolve the container's address: the first non-empty IP among its
    /// networks. `None` means the container has no resolvable address.
    pub fn resolve_ip(&self) -> Option<&str> {
        self.networks
            .iter()
            .map(|n| n.ip.as_str())
            .find(|ip| !ip.is_empty())
    }

    /// Whether this container should contribute routes at all.
    pub fn is_routable(&self) -> bool {
        self.expose.is_some() && !self.is_oneoff
    }
}

/// A single container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub kind: EventKind,
    pub container: ContainerSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(networks: Vec<ContainerNetwork>) -> ContainerSummary {
        ContainerSummary {
            id: "c1".to_string(),
            expose: Some("svc.local/api=9000".to_string()),
            networks,
            is_oneoff: false,
        }
    }

    #[test]
    fn test_event_kind_from_status() {
        assert_eq!(EventKind::from_status("start"), EventKind::Start);
        assert_eq!(EventKind::from_status("die"), EventKind::Die);
        assert_eq!(EventKind::from_status("restart"), EventKind::Other);
        assert_eq!(EventKind::from_status(""), EventKind::Other);
    }

    #[test]
    fn test_resolve_ip_skips_empty() {
        let c = summary(vec![
            ContainerNetwork {
                name: "overlay".to_string(),
                ip: String::new(),
            },
            ContainerNetwork {
                name: "bridge".to_string(),
                ip: "172.17.0.2".to_string(),
            },
        ]);
        assert_eq!(c.resolve_ip(), Some("172.17.0.2"));
    }

    #[test]
    fn test_resolve_ip_none_when_unattached() {
        let c = summary(Vec::new());
        assert_eq!(c.resolve_ip(), None);
    }

    #[test]
    fn test_oneoff_not_routable() {
        let mut c = summary(Vec::new());
        c.is_oneoff = true;
        assert!(!c.is_routable());

        let mut c = summary(Vec::new());
        c.expose = None;
        assert!(!c.is_routable());
    }

    #[test]
    fn test_event_roundtrips_through_json() {
        let event = ContainerEvent {
            kind: EventKind::Die,
            container: summary(Vec::new()),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ContainerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
