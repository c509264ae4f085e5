//! Control channel to the local routing daemon.
//!
//! Only two actions are consumed: withdraw the anycast announcement and
//! re-announce it. Peering itself is the daemon's business.

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

pub mod bird;
pub use bird::BirdControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteCommand {
    /// Withdraw the announcement.
    Down,
    /// Re-announce it.
    Up,
}

impl RouteCommand {
    pub fn token(&self) -> &'static str {
        match self {
            RouteCommand::Down => "down",
            RouteCommand::Up => "up",
        }
    }
}

impl fmt::Display for RouteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[async_trait]
pub trait RoutingControl: Send + Sync {
    /// Send one command and return the daemon's acknowledgement.
    ///
    /// Repeating a command the daemon already applied is acknowledged as a
    /// no-op, not reported as a failure.
    async fn send(&self, command: RouteCommand) -> Result<String>;
}
