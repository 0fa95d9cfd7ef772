pub mod config;
pub mod discovery;
pub mod proxy;
pub mod sync;

pub use proxy::{
    parse_expose, Backend, HeadPeeker, HostKey, IoStream, Listener, ListenerConfig, ListenerMode,
    ListenerStats, PeekConfig, PeekResult, RequestHead, RouteDecl, RouteTable, SharedRouteTable,
};
pub use sync::{run_sync_loop, LocalOverride, Reducer};
