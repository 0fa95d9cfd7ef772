//! dockgate proxy
//!
//! Self-reconfiguring HTTP/TLS reverse proxy for containerized services.
//!
//! This service:
//! - Watches the Docker Engine API for container lifecycle events
//! - Folds exposure annotations into a host/path route table
//! - Accepts HTTP (and, when certificates exist, HTTPS) connections
//! - Peeks the request head and relays bytes to the matched backend
//! - Redirects plaintext traffic to HTTPS when TLS is active

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dockgate_proxy::config::Config;
use dockgate_proxy::discovery::DockerProvider;
use dockgate_proxy::proxy::{init_crypto_provider, load_acceptor};
use dockgate_proxy::{
    run_sync_loop, Listener, ListenerConfig, ListenerMode, Reducer, RouteTable,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to DOCKGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting dockgate proxy");
    info!(
        docker_url = %config.docker_url,
        bind_address = %config.bind_address,
        cert_dir = %config.cert_dir.display(),
        local_override_count = config.local_ports.len(),
        "Configuration loaded"
    );

    init_crypto_provider();

    // Create shared state
    let route_table = Arc::new(RouteTable::new());
    let reducer = Reducer::new(Arc::clone(&route_table), config.local_overrides());
    reducer.seed_overrides();

    let acceptor = load_acceptor(&config.cert_dir)?;

    let mut listener_config = ListenerConfig::new(config.http_addr()?);
    listener_config.max_connections = config.max_connections;
    listener_config.connect_timeout = config.connect_timeout;
    listener_config.idle_timeout = config.idle_timeout;

    let bindings = match acceptor {
        Some(acceptor) => {
            info!(cert_dir = %config.cert_dir.display(), "Certificates found, TLS enabled");
            let mut tls_config = listener_config.clone();
            tls_config.bind_addr = config.https_addr()?;
            vec![
                (tls_config, ListenerMode::TlsTerminating(acceptor)),
                (listener_config, ListenerMode::HttpsRedirect),
            ]
        }
        None => {
            info!(cert_dir = %config.cert_dir.display(), "No certificates, serving plain HTTP");
            vec![(listener_config, ListenerMode::Plain)]
        }
    };

    let mut listener_handles = Vec::new();
    for (listener_config, mode) in bindings {
        let bind_addr = listener_config.bind_addr;
        let listener = Listener::bind(listener_config, mode, Arc::clone(&route_table))
            .await
            .with_context(|| format!("Failed to bind {bind_addr}"))?;
        let listener = Arc::new(listener);
        let handle = tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(error = %e, "Listener error");
            }
        });
        listener_handles.push(handle);
    }

    // Run discovery sync loop (blocks until error or shutdown)
    let provider = DockerProvider::new(&config.docker_url)?;
    run_sync_loop(provider, reducer, config.sync_retry_interval).await
}
