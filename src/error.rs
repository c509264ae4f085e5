use std::path::PathBuf;

use thiserror::Error;

use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Unknown or unauthorized agent identity. The connection is rejected
    /// and nothing is persisted.
    #[error("agent identity is unknown or not authorized")]
    AuthorizationFailure,

    /// A single node's manifest push failed. Recorded per node, never
    /// escalated to the rest of the broadcast.
    #[error("push to node {node} failed: {reason}")]
    TransportFailure { node: NodeId, reason: String },

    /// The local routing daemon could not be reached, so the route state
    /// is unconfirmed.
    #[error("routing daemon unavailable at {}: {reason}", path.display())]
    RoutingDaemonUnavailable { path: PathBuf, reason: String },

    /// The routing daemon answered but reported a failure.
    #[error("routing daemon rejected `{command}`: {reply}")]
    RoutingDaemonError { command: String, reply: String },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("node {0} is already registered")]
    DuplicateNode(NodeId),

    #[error("serial {proposed} for zone {zone} does not advance past {current}")]
    SerialRegression {
        zone: String,
        current: u64,
        proposed: u64,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ControlError {
    /// Whether this failure leaves the node possibly receiving anycast
    /// traffic while unhealthy.
    pub fn is_routing_failure(&self) -> bool {
        matches!(
            self,
            ControlError::RoutingDaemonUnavailable { .. } | ControlError::RoutingDaemonError { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
