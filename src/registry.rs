//! Edge node registry.
//!
//! Owns every [`EdgeNode`] record. Reads (fan-out snapshots, liveness
//! lookups) run concurrently; writes are serialized per record by the
//! map's shard locks. Records are never removed automatically; revoking a
//! node only flips its `authorized` flag.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{ControlError, Result};
use crate::types::{EdgeNode, NodeId, Region};

/// Seed description of a node, as supplied by the registration side.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSeed {
    pub id: NodeId,
    pub endpoint: String,
    pub region: Region,
    pub auth_key: String,
    #[serde(default)]
    pub authorized: bool,
}

#[derive(Debug, Default)]
pub struct EdgeRegistry {
    nodes: DashMap<NodeId, EdgeNode>,
}

fn digest(auth_key: &str) -> String {
    hex::encode(Sha256::digest(auth_key.as_bytes()))
}

impl EdgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new node. It starts unauthorized and unseen.
    pub fn register(
        &self,
        id: NodeId,
        endpoint: impl Into<String>,
        region: Region,
        auth_key: &str,
    ) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.nodes.entry(id.clone()) {
            Entry::Occupied(_) => Err(ControlError::DuplicateNode(id)),
            Entry::Vacant(slot) => {
                let endpoint = endpoint.into();
                info!("Registered node {} ({}, {})", id, endpoint, region);
                slot.insert(EdgeNode {
                    id,
                    endpoint,
                    authorized: false,
                    last_seen: None,
                    region,
                    auth_digest: digest(auth_key),
                });
                Ok(())
            }
        }
    }

    /// Register a seeded node, applying its initial authorization flag.
    pub fn register_seed(&self, seed: NodeSeed) -> Result<()> {
        let id = seed.id.clone();
        self.register(seed.id, seed.endpoint, seed.region, &seed.auth_key)?;
        if seed.authorized {
            self.authorize(&id)?;
        }
        Ok(())
    }

    pub fn authorize(&self, id: &NodeId) -> Result<()> {
        self.set_authorized(id, true)
    }

    pub fn revoke(&self, id: &NodeId) -> Result<()> {
        self.set_authorized(id, false)
    }

    fn set_authorized(&self, id: &NodeId, authorized: bool) -> Result<()> {
        let mut node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ControlError::UnknownNode(id.clone()))?;
        if node.authorized != authorized {
            info!(
                "Node {} {}",
                id,
                if authorized { "authorized" } else { "revoked" }
            );
        }
        node.authorized = authorized;
        Ok(())
    }

    /// Resolve a presented identity header to an authorized node.
    pub fn authenticate(&self, auth_key: &str) -> Result<NodeId> {
        let presented = digest(auth_key);
        self.nodes
            .iter()
            .find(|node| node.auth_digest == presented)
            .filter(|node| {
                if !node.authorized {
                    debug!("Node {} is not authorized", node.id);
                }
                node.authorized
            })
            .map(|node| node.id.clone())
            .ok_or(ControlError::AuthorizationFailure)
    }

    /// Record a heartbeat. `last_seen` never moves backwards.
    pub fn touch(&self, id: &NodeId, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ControlError::UnknownNode(id.clone()))?;
        let seen = match node.last_seen {
            Some(previous) if previous > at => previous,
            _ => at,
        };
        node.last_seen = Some(seen);
        Ok(seen)
    }

    pub fn get(&self, id: &NodeId) -> Option<EdgeNode> {
        self.nodes.get(id).map(|node| node.clone())
    }

    /// Point-in-time copy of every authorized node, sorted by id.
    pub fn authorized_snapshot(&self) -> Vec<EdgeNode> {
        let mut nodes: Vec<EdgeNode> = self
            .nodes
            .iter()
            .filter(|node| node.authorized)
            .map(|node| node.clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registry_with(id: &str, key: &str, authorized: bool) -> EdgeRegistry {
        let registry = EdgeRegistry::new();
        registry
            .register_seed(NodeSeed {
                id: NodeId::from(id),
                endpoint: format!("{id}.edge.test"),
                region: Region::UsWest,
                auth_key: key.to_string(),
                authorized,
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_new_node_starts_unauthorized() {
        let registry = EdgeRegistry::new();
        registry
            .register(NodeId::from("n1"), "n1.edge.test", Region::EuWest, "secret")
            .unwrap();

        let node = registry.get(&NodeId::from("n1")).unwrap();
        assert!(!node.authorized);
        assert!(node.last_seen.is_none());
        assert!(matches!(
            registry.authenticate("secret"),
            Err(ControlError::AuthorizationFailure)
        ));
        assert!(matches!(
            registry.register(NodeId::from("n1"), "x", Region::EuWest, "other"),
            Err(ControlError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_authenticate() {
        let registry = registry_with("n1", "secret", true);

        assert_eq!(registry.authenticate("secret").unwrap(), NodeId::from("n1"));
        assert!(registry.authenticate("wrong").is_err());

        registry.revoke(&NodeId::from("n1")).unwrap();
        assert!(registry.authenticate("secret").is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let registry = registry_with("n1", "secret", true);
        let id = NodeId::from("n1");
        let t0 = Utc::now();

        assert_eq!(registry.touch(&id, t0).unwrap(), t0);
        assert_eq!(registry.touch(&id, t0 - Duration::seconds(5)).unwrap(), t0);
        let later = t0 + Duration::seconds(30);
        assert_eq!(registry.touch(&id, later).unwrap(), later);
        assert_eq!(registry.get(&id).unwrap().last_seen, Some(later));

        assert!(matches!(
            registry.touch(&NodeId::from("ghost"), t0),
            Err(ControlError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_authorized_snapshot() {
        let registry = registry_with("b", "kb", true);
        registry
            .register(NodeId::from("a"), "a.edge.test", Region::UsCentral, "ka")
            .unwrap();
        registry.authorize(&NodeId::from("a")).unwrap();
        registry
            .register(NodeId::from("c"), "c.edge.test", Region::EuCentral, "kc")
            .unwrap();

        let ids: Vec<_> = registry
            .authorized_snapshot()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![NodeId::from("a"), NodeId::from("b")]);
    }
}
