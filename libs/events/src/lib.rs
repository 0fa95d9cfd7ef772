//! # dockgate-events
//!
//! Container lifecycle event and metadata types for dockgate.
//!
//! ## Design Principles
//!
//! - The proxy core never sees a provider's native container object;
//!   providers translate into the small fixed shapes defined here
//! - Events carry everything the reducer needs (exposure annotation,
//!   networks, one-off flag), so processing an event requires no further
//!   provider round-trips
//! - Event order is meaningful: `Start` before `Die` and `Die` before
//!   `Start` for the same container produce different final route state

mod types;

pub use types::*;
