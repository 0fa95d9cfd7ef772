//! Container discovery provider.
//!
//! The reducer only ever sees `dockgate_events` shapes; this module owns
//! the translation from the Docker Engine API (container listing,
//! inspect, and the NDJSON `/events` stream). Reconnection is the
//! caller's loop: any stream failure surfaces as an error and the next
//! call starts a fresh stream.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use dockgate_events::{
    ContainerEvent, ContainerNetwork, ContainerSummary, EventKind, EXPOSE_LABEL, ONEOFF_LABEL,
};

/// Abstract source of container snapshots and lifecycle events.
#[async_trait]
pub trait DiscoveryProvider: Send {
    /// One-shot snapshot of currently running containers.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Next lifecycle event, in stream order.
    async fn next_event(&mut self) -> Result<ContainerEvent>;
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send + Sync>>;

/// Docker Engine API provider.
pub struct DockerProvider {
    client: reqwest::Client,
    base_url: String,
    stream: Option<ByteStream>,
    line_buf: Vec<u8>,
}

impl DockerProvider {
    pub fn new(docker_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("dockgate-proxy/0.1.0")
            .build()
            .context("Failed to build Docker API client")?;

        Ok(Self {
            client,
            base_url: docker_url.trim_end_matches('/').to_string(),
            stream: None,
            line_buf: Vec::new(),
        })
    }

    async fn inspect(&self, id: &str) -> Result<ContainerSummary> {
        let url = format!("{}/containers/{}/json", self.base_url, id);
        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "container inspect failed (status={}): {}",
                status,
                body
            ));
        }

        let inspect = resp.json::<ApiContainerInspect>().await?;
        Ok(inspect.into_summary())
    }

    async fn open_event_stream(&self) -> Result<ByteStream> {
        let url = format!("{}/events", self.base_url);
        let resp = self
            .client
            .get(url)
            .query(&[("filters", r#"{"type":["container"]}"#)])
            .send()
            .await
            .context("Failed to open event stream")?;

        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "event stream request failed (status={})",
                resp.status()
            ));
        }

        debug!("Event stream opened");
        Ok(Box::pin(resp.bytes_stream()))
    }

    /// Pop one complete NDJSON line out of the line buffer.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let at = self.line_buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.line_buf.drain(..=at).collect();
        line.pop();
        Some(line)
    }
}

#[async_trait]
impl DiscoveryProvider for DockerProvider {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let url = format!("{}/containers/json", self.base_url);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to list containers")?;

        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "container listing failed (status={})",
                resp.status()
            ));
        }

        let containers = resp.json::<Vec<ApiContainer>>().await?;
        Ok(containers.into_iter().map(ApiContainer::into_summary).collect())
    }

    async fn next_event(&mut self) -> Result<ContainerEvent> {
        loop {
            if let Some(line) = self.take_line() {
                if line.is_empty() {
                    continue;
                }
                let Some(event) = parse_event_line(&line)? else {
                    continue;
                };

                // A start event carries no network data in its
                // attributes; inspect fills it in. A failed inspect
                // still yields the event, just without an address.
                if event.kind == EventKind::Start && event.container.is_routable() {
                    match self.inspect(&event.container.id).await {
                        Ok(summary) => {
                            return Ok(ContainerEvent {
                                kind: EventKind::Start,
                                container: summary,
                            })
                        }
                        Err(e) => {
                            debug!(container = %event.container.id, error = %e, "Inspect failed");
                            return Ok(event);
                        }
                    }
                }
                return Ok(event);
            }

            if self.stream.is_none() {
                self.line_buf.clear();
                self.stream = Some(self.open_event_stream().await?);
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };

            let chunk = match stream.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(e).context("Event stream read failed");
                }
                None => {
                    self.stream = None;
                    return Err(anyhow::anyhow!("event stream closed"));
                }
            };
            self.line_buf.extend_from_slice(&chunk);
        }
    }
}

/// Parse one event line into a `ContainerEvent`; `None` for events the
/// reducer can never act on (no actor).
fn parse_event_line(line: &[u8]) -> Result<Option<ContainerEvent>> {
    let event: ApiEvent = serde_json::from_slice(line).context("Invalid event JSON")?;

    let kind = match event.kind.as_deref() {
        Some("container") => EventKind::from_status(event.status.as_deref().unwrap_or("")),
        _ => EventKind::Other,
    };

    let Some(actor) = event.actor else {
        return Ok(None);
    };

    Ok(Some(ContainerEvent {
        kind,
        container: summary_from_attributes(actor.id, &actor.attributes),
    }))
}

/// Build a container summary from event attributes alone. Networks stay
/// empty: removal needs no address, and start events get re-inspected.
fn summary_from_attributes(id: String, attributes: &HashMap<String, String>) -> ContainerSummary {
    ContainerSummary {
        id,
        expose: attributes.get(EXPOSE_LABEL).cloned(),
        networks: Vec::new(),
        is_oneoff: is_oneoff_label(attributes),
    }
}

fn is_oneoff_label(labels: &HashMap<String, String>) -> bool {
    labels
        .get(ONEOFF_LABEL)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

// Docker Engine API wire shapes. Networks use a BTreeMap so address
// resolution iterates in a stable order.

#[derive(Debug, Deserialize)]
struct ApiContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: ApiNetworkSettings,
}

impl ApiContainer {
    fn into_summary(self) -> ContainerSummary {
        ContainerSummary {
            id: self.id,
            expose: self.labels.get(EXPOSE_LABEL).cloned(),
            networks: self.network_settings.into_networks(),
            is_oneoff: is_oneoff_label(&self.labels),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiContainerInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Config", default)]
    config: ApiContainerConfig,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: ApiNetworkSettings,
}

impl ApiContainerInspect {
    fn into_summary(self) -> ContainerSummary {
        ContainerSummary {
            id: self.id,
            expose: self.config.labels.get(EXPOSE_LABEL).cloned(),
            networks: self.network_settings.into_networks(),
            is_oneoff: is_oneoff_label(&self.config.labels),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ApiContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: BTreeMap<String, ApiNetwork>,
}

impl ApiNetworkSettings {
    fn into_networks(self) -> Vec<ContainerNetwork> {
        self.networks
            .into_iter()
            .map(|(name, network)| ContainerNetwork {
                name,
                ip: network.ip_address,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Default)]
struct ApiNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[derive(Debug, Deserialize)]
struct ApiEvent {
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "Type", default)]
    kind: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: Option<ApiActor>,
}

#[derive(Debug, Deserialize)]
struct ApiActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}
