//! Fleet synchronization and self-eviction for the Packetframe CDN.
//!
//! The coordinator side pushes the zone manifest to every authorized edge
//! node ([`fanout`]), tracks agent liveness over persistent channels
//! ([`gateway`]) and reports stale nodes ([`monitor`]). The edge side
//! ([`agent`]) answers heartbeats and withdraws its anycast route through
//! the local routing daemon ([`routing`]) when it cannot serve.

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod manifest;
pub mod monitor;
pub mod registry;
pub mod routing;
pub mod server;
pub mod types;

pub use error::{ControlError, Result};
