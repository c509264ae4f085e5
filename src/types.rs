//! Data structures shared by the coordinator and the edge agent.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and travel
//! either in the body of a manifest push or as frames on the persistent
//! agent channel.  The fields are kept minimal; everything else about a zone
//! (records, DNSSEC material) is owned by the zone-management side.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One `(zone, serial)` pair of the authoritative manifest.
///
/// The serial is derived from a nanosecond clock and strictly increases for
/// a given zone, so an edge node compares it against its cached copy to
/// decide whether to refetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub zone: String,
    pub serial: u64,
}

impl ManifestEntry {
    pub fn new(zone: impl Into<String>, serial: u64) -> Self {
        Self {
            zone: zone.into(),
            serial,
        }
    }
}

/// Opaque edge node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Deployment region of an edge node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Region {
    UsWest,
    UsCentral,
    EuWest,
    EuCentral,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::UsWest => "us-west",
            Region::UsCentral => "us-central",
            Region::EuWest => "eu-west",
            Region::EuCentral => "eu-central",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known edge node, as held by the registry.
///
/// `last_seen` is `None` until the first authenticated heartbeat and is
/// never cleared afterwards: a stale timestamp is itself the signal that
/// the node went away.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeNode {
    pub id: NodeId,
    /// `host[:port]` of the node's update listener.
    pub endpoint: String,
    pub authorized: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub region: Region,
    #[serde(skip)]
    pub(crate) auth_digest: String,
}

/// Advisory health signal: an authorized node whose last heartbeat is
/// older than the staleness threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleNode {
    pub id: NodeId,
    pub last_seen: Option<DateTime<Utc>>,
    /// Seconds since `last_seen`, `None` when the node was never seen.
    pub silent_for_secs: Option<i64>,
}

/// A frame on the persistent agent channel.
///
/// Encoded as JSON text frames, e.g. `{"event":"ping"}` or
/// `{"event":"terminate","reason":"revoked"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Liveness probe, coordinator → agent.
    Ping,
    /// Liveness reply, agent → coordinator.
    Pong,
    /// Unconditional authorization revocation, coordinator → agent.
    Terminate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl AgentFrame {
    pub fn terminate(reason: impl Into<String>) -> Self {
        AgentFrame::Terminate {
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_format() {
        assert_eq!(
            serde_json::to_string(&AgentFrame::Ping).unwrap(),
            r#"{"event":"ping"}"#
        );
        assert_eq!(
            serde_json::to_string(&AgentFrame::terminate("revoked")).unwrap(),
            r#"{"event":"terminate","reason":"revoked"}"#
        );

        let frame: AgentFrame = serde_json::from_str(r#"{"event":"terminate"}"#).unwrap();
        assert_eq!(frame, AgentFrame::Terminate { reason: None });
    }

    #[test]
    fn test_region_names() {
        let region: Region = serde_json::from_str(r#""eu-central""#).unwrap();
        assert_eq!(region, Region::EuCentral);
        assert_eq!(
            serde_json::to_string(&Region::UsWest).unwrap(),
            r#""us-west""#
        );
        assert_eq!(Region::UsWest.to_string(), "us-west");
        assert!(serde_json::from_str::<Region>(r#""mars-north""#).is_err());
    }

    #[test]
    fn test_manifest_body() {
        let body = serde_json::to_string(&vec![ManifestEntry::new("example.com", 5)]).unwrap();
        assert_eq!(body, r#"[{"zone":"example.com","serial":5}]"#);
    }
}
