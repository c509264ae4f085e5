//! Coordinator wiring: registry, manifest, gateway, fan-out, health loop.

use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CoordinatorConfig;
use crate::fanout::{FanoutBroadcaster, HttpsTransport};
use crate::gateway::HeartbeatGateway;
use crate::manifest::ManifestStore;
use crate::monitor::HealthMonitor;
use crate::registry::{EdgeRegistry, NodeSeed};
use crate::server::{self, AppState};
use crate::types::{ManifestEntry, StaleNode};

/// Initial fleet state, supplied by the zone and node management side.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub zones: Vec<ManifestEntry>,
    #[serde(default)]
    pub nodes: Vec<NodeSeed>,
}

impl Seed {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    state: Arc<AppState>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        manifest: Arc<ManifestStore>,
        registry: Arc<EdgeRegistry>,
    ) -> anyhow::Result<Self> {
        let transport = HttpsTransport::with_scheme(config.push_scheme.clone(), config.push_timeout())?;
        let mut broadcaster = FanoutBroadcaster::new(Arc::clone(&registry), Arc::new(transport))
            .with_timeout(config.push_timeout());
        if config.exclude_stale_from_fanout {
            broadcaster = broadcaster.with_stale_exclusion(config.stale_after());
        }

        let state = Arc::new(AppState {
            gateway: Arc::new(HeartbeatGateway::new(Arc::clone(&registry))),
            monitor: Arc::new(HealthMonitor::new(Arc::clone(&registry), config.stale_after())),
            broadcaster: Arc::new(broadcaster),
            manifest,
            registry,
        });
        Ok(Self { config, state })
    }

    /// Build from configuration, loading the seed file if one is set.
    pub fn from_config(config: CoordinatorConfig) -> anyhow::Result<Self> {
        let seed = match &config.seed_file {
            Some(path) => Seed::load(path)?,
            None => Seed::default(),
        };

        let registry = EdgeRegistry::new();
        for node in seed.nodes {
            registry.register_seed(node)?;
        }
        let manifest = ManifestStore::from_entries(seed.zones);
        info!(
            "Loaded {} nodes and {} zones",
            registry.len(),
            manifest.len()
        );

        Self::new(config, Arc::new(manifest), Arc::new(registry))
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Ping every Active agent once per heartbeat interval.
    fn spawn_ping_loop(&self) -> JoinHandle<()> {
        let gateway = Arc::clone(&self.state.gateway);
        let interval = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                gateway.ping();
            }
        })
    }

    fn spawn_stale_handler(&self, mut events: mpsc::Receiver<StaleNode>) -> JoinHandle<()> {
        let gateway = Arc::clone(&self.state.gateway);
        let terminate = self.config.terminate_stale;
        tokio::spawn(async move {
            while let Some(stale) = events.recv().await {
                if terminate && gateway.terminate(&stale.id, "heartbeat stale") > 0 {
                    warn!("Terminated stale connection of {}", stale.id);
                }
            }
        })
    }

    /// Run all coordinator tasks on `listener` until the server fails.
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        let (stale_tx, stale_rx) = mpsc::channel(64);
        let monitor = Arc::clone(&self.state.monitor).spawn(self.config.heartbeat_interval(), stale_tx);
        let pinger = self.spawn_ping_loop();
        let stale_handler = self.spawn_stale_handler(stale_rx);

        let result = server::serve(listener, Arc::clone(&self.state)).await;
        if let Err(e) = &result {
            error!("Coordinator server failed: {}", e);
        }

        monitor.abort();
        pinger.abort();
        stale_handler.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{SessionEvent, SessionState};
    use crate::types::{NodeId, Region};
    use std::io::Write;

    #[test]
    fn test_seed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "zones": [{{"zone": "example.com.", "serial": 5}}],
                "nodes": [
                    {{"id": "n1", "endpoint": "n1.edge:443", "region": "us-west", "auth_key": "k1", "authorized": true}},
                    {{"id": "n2", "endpoint": "n2.edge:443", "region": "eu-central", "auth_key": "k2"}}
                ]
            }}"#
        )
        .unwrap();

        let config = CoordinatorConfig {
            seed_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let coordinator = Coordinator::from_config(config).unwrap();
        let state = coordinator.state();

        assert_eq!(
            state.manifest.snapshot(),
            vec![ManifestEntry::new("example.com", 5)]
        );
        assert_eq!(state.registry.len(), 2);
        assert_eq!(state.registry.authorized_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_node_keeps_connection_by_default() {
        let registry = Arc::new(EdgeRegistry::new());
        registry
            .register_seed(NodeSeed {
                id: NodeId::from("n1"),
                endpoint: "n1.edge:443".into(),
                region: Region::UsWest,
                auth_key: "k1".into(),
                authorized: true,
            })
            .unwrap();
        let coordinator = Coordinator::new(
            CoordinatorConfig::default(),
            Arc::new(ManifestStore::new()),
            Arc::clone(&registry),
        )
        .unwrap();
        let gateway = Arc::clone(&coordinator.state().gateway);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = gateway.open_session(tx);
        session.handle(SessionEvent::Handshake {
            auth_key: Some("k1".into()),
        });
        session.handle(SessionEvent::Authorize);
        assert!(matches!(session.state(), SessionState::Active { .. }));

        let (events_tx, events_rx) = mpsc::channel(4);
        let handler = coordinator.spawn_stale_handler(events_rx);
        events_tx
            .send(StaleNode {
                id: NodeId::from("n1"),
                last_seen: None,
                silent_for_secs: None,
            })
            .await
            .unwrap();
        drop(events_tx);
        handler.await.unwrap();

        assert_eq!(gateway.connection_count(), 1);
        assert!(rx.try_recv().is_err());
        assert!(matches!(session.state(), SessionState::Active { .. }));
        assert!(registry.get(&NodeId::from("n1")).unwrap().authorized);
    }
}
