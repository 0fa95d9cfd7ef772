//! HTTP-aware TCP proxy implementation.
//!
//! This module provides:
//! - TCP listener management with optional TLS termination
//! - Incremental HTTP request-head peeking
//! - Host/path routing against the shared route table
//! - Header rewriting for external backends
//! - Bidirectional byte relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Head Peeker -> Route Table -> Backend
//!              |                            |
//!         TLS accept (if terminating)  Host rewrite (external only)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, ListenerMode, RouteTable};
//!
//! let route_table = Arc::new(RouteTable::new());
//! let config = ListenerConfig::new("[::]:80".parse()?);
//! let listener = Listener::bind(config, ListenerMode::Plain, route_table).await?;
//! listener.run().await?;
//! ```

pub mod expose;
mod http;
mod listener;
pub(crate) mod router;
mod tls;

pub use expose::{parse_expose, ExposeError, RouteDecl};
pub use http::{HeadPeeker, PeekConfig, PeekResult, RequestHead};
pub use listener::{relay, IoStream, Listener, ListenerConfig, ListenerMode, ListenerStats};
pub use router::{
    normalize_path, strip_host_port, Backend, HostKey, RouteTable, SharedRouteTable,
};
pub use tls::{backend_connector, init_crypto_provider, load_acceptor, CERT_FILE, KEY_FILE};
