//! Proxy configuration.
//!
//! Everything is env-driven so the proxy can run unmodified inside a
//! container next to the services it fronts.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::sync::LocalOverride;

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Docker Engine API base URL (example: http://localhost:2375).
    pub docker_url: String,

    /// Address the listeners bind on.
    pub bind_address: String,

    /// Plaintext HTTP port.
    pub http_port: u16,

    /// TLS port, used only when certificates are present.
    pub https_port: u16,

    /// Directory searched for fullchain.pem / privkey.pem.
    pub cert_dir: PathBuf,

    /// Address local-override routes point at.
    pub local_address: String,

    /// Exposure annotations for local-override routes.
    pub local_ports: Vec<String>,

    /// Cap on concurrently served client connections.
    pub max_connections: usize,

    /// Timeout for backend TCP connects.
    pub connect_timeout: Duration,

    /// Idle cutoff for established relays. None disables it.
    pub idle_timeout: Option<Duration>,

    /// Backoff between discovery retries.
    pub sync_retry_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let docker_url = std::env::var("DOCKGATE_DOCKER_URL")
            .unwrap_or_else(|_| "http://localhost:2375".to_string());

        let bind_address =
            std::env::var("DOCKGATE_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string());

        let http_port: u16 = std::env::var("DOCKGATE_HTTP_PORT")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DOCKGATE_HTTP_PORT must be a port number.")?
            .unwrap_or(80);

        let https_port: u16 = std::env::var("DOCKGATE_HTTPS_PORT")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DOCKGATE_HTTPS_PORT must be a port number.")?
            .unwrap_or(443);

        let cert_dir = std::env::var("DOCKGATE_CERT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/certs"));

        let local_address =
            std::env::var("DOCKGATE_LOCAL_ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string());

        let local_ports = std::env::var("DOCKGATE_LOCAL_PORTS")
            .or_else(|_| std::env::var("LOCAL_PORTS"))
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let max_connections: usize = std::env::var("DOCKGATE_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DOCKGATE_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(10_000)
            .max(1);

        let connect_timeout_ms: u64 = std::env::var("DOCKGATE_CONNECT_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DOCKGATE_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(50));

        let idle_timeout_secs: u64 = std::env::var("DOCKGATE_IDLE_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DOCKGATE_IDLE_TIMEOUT_SECS must be an integer (seconds, 0 disables).")?
            .unwrap_or(120);
        let idle_timeout = (idle_timeout_secs > 0).then(|| Duration::from_secs(idle_timeout_secs));

        let sync_retry_ms: u64 = std::env::var("DOCKGATE_SYNC_RETRY_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("DOCKGATE_SYNC_RETRY_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);
        let sync_retry_interval = Duration::from_millis(sync_retry_ms.max(50));

        let log_level = std::env::var("DOCKGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            docker_url,
            bind_address,
            http_port,
            https_port,
            cert_dir,
            local_address,
            local_ports,
            max_connections,
            connect_timeout,
            idle_timeout,
            sync_retry_interval,
            log_level,
        })
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.http_port)
            .parse()
            .context("Invalid HTTP bind address.")
    }

    pub fn https_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.https_port)
            .parse()
            .context("Invalid HTTPS bind address.")
    }

    /// Local-override declarations, all pointing at `local_address`.
    pub fn local_overrides(&self) -> Vec<LocalOverride> {
        self.local_ports
            .iter()
            .map(|annotation| LocalOverride {
                annotation: annotation.clone(),
                address: self.local_address.clone(),
            })
            .collect()
    }
}
