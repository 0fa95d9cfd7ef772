//! Listeners and the per-connection proxy engine.
//!
//! Each accepted connection walks a fixed path: peek the request head,
//! decide (redirect / reject / dispatch), open the backend connection,
//! flush the buffered client bytes, then splice bytes both ways until
//! either side closes. After dispatch the proxy is fully transparent.
//!
//! Listener modes:
//! - `Plain`: full proxy on a cleartext socket (no certificate present)
//! - `TlsTerminating`: full proxy behind a TLS handshake
//! - `HttpsRedirect`: the port-80 half of a TLS deployment; answers
//!   every request with a 301 to its HTTPS sibling and never contacts a
//!   backend

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn, Instrument};

use super::http::{self, HeadPeeker, PeekConfig, PeekResult};
use super::router::{Backend, RouteTable};
use super::tls;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default timeout for establishing a backend connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default idle timeout for an established relay.
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = Some(Duration::from_secs(120));

/// Byte stream the relay can drive; satisfied by plain and TLS sockets.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

/// What a listener does with the connections it accepts.
#[derive(Clone)]
pub enum ListenerMode {
    /// Full proxy over plain TCP.
    Plain,
    /// Full proxy behind TLS termination.
    TlsTerminating(TlsAcceptor),
    /// Redirect-only plain listener paired with a TLS listener.
    HttpsRedirect,
}

impl ListenerMode {
    fn label(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::TlsTerminating(_) => "tls",
            Self::HttpsRedirect => "redirect",
        }
    }
}

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Request-head peek bounds.
    pub peek: PeekConfig,
    /// Backend connect timeout.
    pub connect_timeout: Duration,
    /// Idle timeout for established relays.
    pub idle_timeout: Option<Duration>,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            peek: PeekConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connections_rejected: AtomicU64,
    /// Requests answered 400.
    pub requests_bad: AtomicU64,
    /// Requests answered with the HTTPS redirect.
    pub requests_redirected: AtomicU64,
    /// Requests answered 503 (no route or unresolved backend).
    pub requests_unrouted: AtomicU64,
    pub backend_connected: AtomicU64,
    pub backend_failed: AtomicU64,
    pub bytes_to_backend: AtomicU64,
    pub bytes_from_backend: AtomicU64,
}

/// A listener for the proxy engine.
pub struct Listener {
    config: ListenerConfig,
    mode: ListenerMode,
    listener: TcpListener,
    route_table: Arc<RouteTable>,
    conn_semaphore: Arc<Semaphore>,
    peeker: HeadPeeker,
    backend_connector: TlsConnector,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a listener. Failing to bind is a startup failure and is the
    /// caller's problem; nothing else in this module is.
    pub async fn bind(
        config: ListenerConfig,
        mode: ListenerMode,
        route_table: Arc<RouteTable>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            mode = mode.label(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            peeker: HeadPeeker::with_config(config.peek.clone()),
            backend_connector: tls::backend_connector(),
            listener,
            config,
            mode,
            route_table,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, mode = self.mode.label(), "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(
                                    peer_addr = %peer_addr,
                                    error = %e,
                                    "Connection error"
                                );
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection: run the TLS handshake if this is a
    /// terminating listener, then serve the proxy state machine.
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        debug!(peer_addr = %peer_addr, "Handling connection");

        match &self.mode {
            ListenerMode::Plain => self.serve(stream, false).await,
            ListenerMode::HttpsRedirect => self.serve(stream, true).await,
            ListenerMode::TlsTerminating(acceptor) => {
                let tls_stream = acceptor.accept(stream).await?;
                self.serve(tls_stream, false).await
            }
        }
    }

    /// The per-connection state machine: peek head, dispatch, relay.
    async fn serve<S: IoStream>(&self, mut client: S, redirect_only: bool) -> io::Result<()> {
        // AwaitingRequestLine / ParsingHeaders: everything read here is
        // kept in `buffer` as the pre-connect write queue.
        let mut buffer = Vec::new();
        let head = match self.peeker.peek(&mut client, &mut buffer).await {
            PeekResult::Head(head) => head,
            PeekResult::Malformed => {
                self.stats.requests_bad.fetch_add(1, Ordering::Relaxed);
                debug!("Malformed request");
                return http::respond_bad_request(&mut client).await;
            }
            PeekResult::Incomplete => {
                debug!("Connection closed before request head completed");
                return Ok(());
            }
            PeekResult::Timeout => {
                debug!("Timed out waiting for request head");
                return Ok(());
            }
            PeekResult::IoError(e) => return Err(io::Error::other(e)),
        };

        let host = head.host_name().unwrap_or("").to_string();
        debug!(host = %host, path = %head.path, "Request head parsed");

        if redirect_only {
            if host.is_empty() {
                self.stats.requests_bad.fetch_add(1, Ordering::Relaxed);
                return http::respond_bad_request(&mut client).await;
            }
            self.stats.requests_redirected.fetch_add(1, Ordering::Relaxed);
            return http::respond_https_redirect(&mut client, &host, &head.path).await;
        }

        // Dispatching: resolve a backend or fail explicitly. A route
        // whose address never resolved behaves exactly like no route.
        let backend = match self.route_table.lookup(&host, &head.path) {
            Some(backend) if backend.is_resolvable() => backend,
            _ => {
                self.stats.requests_unrouted.fetch_add(1, Ordering::Relaxed);
                debug!(host = %host, path = %head.path, "No route");
                return http::respond_unavailable(&mut client).await;
            }
        };

        let (target_host, rewrite_host) = match &backend {
            Backend::Direct { ip: Some(ip), .. } => (ip.clone(), None),
            Backend::External { host, .. } => (host.clone(), Some(host.clone())),
            // Unresolvable backends were rejected above.
            Backend::Direct { ip: None, .. } => return Ok(()),
        };
        let needs_tls = matches!(backend, Backend::External { tls: true, .. });

        // Rewriting the outbound host means the buffered head gets one
        // literal Host-line substitution and loses any Referer (it would
        // leak the original origin).
        let outbound_buffer = match (&rewrite_host, &head.host) {
            (Some(new_host), Some(old_host)) => {
                let stripped = http::strip_referer(&buffer, head.head_len);
                http::rewrite_host(&stripped, old_host, new_host)
            }
            _ => buffer,
        };

        let port = backend.port();
        let connect = TcpStream::connect((target_host.as_str(), port));
        let stream = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                // Backend unreachable: close without a structured
                // response, the client may already be mid-stream.
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(target = %target_host, port, error = %e, "Backend connection failed");
                return Ok(());
            }
            Err(_) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(target = %target_host, port, "Backend connection timed out");
                return Ok(());
            }
        };

        let mut backend_stream: Box<dyn IoStream> = if needs_tls {
            let server_name = match ServerName::try_from(target_host.clone()) {
                Ok(name) => name,
                Err(e) => {
                    self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(target = %target_host, error = %e, "Invalid backend server name");
                    return Ok(());
                }
            };
            match self.backend_connector.connect(server_name, stream).await {
                Ok(tls_stream) => Box::new(tls_stream),
                Err(e) => {
                    self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(target = %target_host, error = %e, "Backend TLS handshake failed");
                    return Ok(());
                }
            }
        } else {
            Box::new(stream)
        };

        self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
        debug!(target = %target_host, port, tls = needs_tls, "Connected to backend");

        // Dispatching -> Relaying: flush the pre-connect write queue,
        // then splice until either side closes.
        backend_stream.write_all(&outbound_buffer).await?;

        let (bytes_to_backend, bytes_from_backend) =
            relay(client, backend_stream, self.config.idle_timeout).await?;

        self.stats
            .bytes_to_backend
            .fetch_add(bytes_to_backend + outbound_buffer.len() as u64, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(bytes_from_backend, Ordering::Relaxed);

        debug!(
            bytes_to_backend,
            bytes_from_backend, "Connection closed"
        );

        Ok(())
    }
}

/// Relay bytes bidirectionally between two streams.
///
/// EOF or an error on either side shuts down the paired direction, so
/// closing one end of the pairing tears down the other.
///
/// Returns (bytes a->b, bytes b->a), counting what moved even when a
/// direction ended in an error.
pub async fn relay<A: IoStream, B: IoStream>(
    a: A,
    b: B,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)> {
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; 8192];
        loop {
            let read_result = if let Some(timeout_dur) = idle_timeout {
                match timeout(timeout_dur, a_read.read(&mut buf)).await {
                    Ok(result) => result,
                    Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
                }
            } else {
                a_read.read(&mut buf).await
            };

            match read_result {
                Ok(0) => break,
                Ok(n) => {
                    b_write.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
        b_write.shutdown().await?;
        Ok(total)
    };

    let b_to_a = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; 8192];
        loop {
            let read_result = if let Some(timeout_dur) = idle_timeout {
                match timeout(timeout_dur, b_read.read(&mut buf)).await {
                    Ok(result) => result,
                    Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
                }
            } else {
                b_read.read(&mut buf).await
            };

            match read_result {
                Ok(0) => break,
                Ok(n) => {
                    a_write.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
        a_write.shutdown().await?;
        Ok(total)
    };

    let (a_result, b_result) = tokio::join!(a_to_b, b_to_a);

    // Return bytes transferred even if one direction errored
    let bytes_a_to_b = a_result.unwrap_or(0);
    let bytes_b_to_a = b_result.unwrap_or(0);

    Ok((bytes_a_to_b, bytes_b_to_a))
}
