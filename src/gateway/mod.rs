//! Heartbeat gateway for edge agents.
//!
//! Each agent holds one persistent WebSocket to the coordinator. The
//! gateway authenticates it against the [`EdgeRegistry`], keeps a typed
//! "last message" timestamp per connection, fans liveness probes out to
//! every Active connection and delivers terminate directives.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::EdgeRegistry;
use crate::types::{AgentFrame, NodeId};

pub mod session;
pub mod socket;

pub use session::{Session, SessionEvent, SessionState};
pub use socket::{run_socket, AUTH_HEADER};

pub type ConnectionId = Uuid;

/// An Active agent connection. Holds only a lookup key into the registry.
struct Connection {
    node_id: NodeId,
    last_message: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<AgentFrame>,
}

/// Liveness view of one Active connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connection_id: ConnectionId,
    pub node_id: NodeId,
    pub last_message: DateTime<Utc>,
    pub since_last_message_ms: i64,
}

pub struct HeartbeatGateway {
    registry: Arc<EdgeRegistry>,
    connections: DashMap<ConnectionId, Connection>,
}

impl HeartbeatGateway {
    pub fn new(registry: Arc<EdgeRegistry>) -> Self {
        Self {
            registry,
            connections: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<EdgeRegistry> {
        &self.registry
    }

    /// Start a session for a freshly accepted transport. Frames queued on
    /// `outbound` must be written to the agent by the caller.
    pub fn open_session(&self, outbound: mpsc::UnboundedSender<AgentFrame>) -> Session<'_> {
        Session::new(self, outbound)
    }

    fn attach(
        &self,
        id: ConnectionId,
        node_id: NodeId,
        now: DateTime<Utc>,
        outbound: mpsc::UnboundedSender<AgentFrame>,
    ) {
        if let Err(e) = self.registry.touch(&node_id, now) {
            warn!("Failed to record heartbeat for {}: {}", node_id, e);
        }
        self.connections.insert(
            id,
            Connection {
                node_id,
                last_message: now,
                outbound,
            },
        );
    }

    /// Refresh a live connection. Messages that race a `terminate` find no
    /// entry and leave the registry untouched.
    fn record_message(&self, id: ConnectionId, node_id: &NodeId, now: DateTime<Utc>) {
        match self.connections.get_mut(&id) {
            Some(mut conn) => conn.last_message = conn.last_message.max(now),
            None => {
                debug!("Dropping message on terminated connection {}", id);
                return;
            }
        }
        if let Err(e) = self.registry.touch(node_id, now) {
            warn!("Failed to record heartbeat for {}: {}", node_id, e);
        }
    }

    fn detach(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Send a liveness probe to every Active connection without waiting
    /// for replies. Returns how many probes were queued.
    pub fn ping(&self) -> usize {
        let mut sent = 0;
        for conn in self.connections.iter() {
            match conn.outbound.send(AgentFrame::Ping) {
                Ok(()) => sent += 1,
                Err(_) => debug!("Connection {} already gone", conn.key()),
            }
        }
        debug!("Sent global ping to {} agents", sent);
        sent
    }

    pub fn list_connections(&self) -> Vec<ConnectionStatus> {
        self.list_connections_at(Utc::now())
    }

    pub fn list_connections_at(&self, now: DateTime<Utc>) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<ConnectionStatus> = self
            .connections
            .iter()
            .map(|conn| ConnectionStatus {
                connection_id: *conn.key(),
                node_id: conn.node_id.clone(),
                last_message: conn.last_message,
                since_last_message_ms: (now - conn.last_message).num_milliseconds(),
            })
            .collect();
        statuses.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        statuses
    }

    /// Deliver a terminate directive to every Active connection of
    /// `node_id` and drop them. Returns how many connections were hit.
    pub fn terminate(&self, node_id: &NodeId, reason: &str) -> usize {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|conn| &conn.node_id == node_id)
            .map(|conn| *conn.key())
            .collect();

        for id in &ids {
            if let Some((_, conn)) = self.connections.remove(id) {
                let _ = conn.outbound.send(AgentFrame::terminate(reason));
            }
        }
        if !ids.is_empty() {
            info!(
                "Terminated {} connection(s) of {}: {}",
                ids.len(),
                node_id,
                reason
            );
        }
        ids.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
