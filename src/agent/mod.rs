//! Edge-resident agent.
//!
//! Keeps a persistent channel to the coordinator's heartbeat gateway,
//! answers liveness probes, and runs the local health loop that drives
//! [`SelfEvictionController`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::config::AgentConfig;
use crate::gateway::AUTH_HEADER;
use crate::routing::BirdControl;
use crate::types::AgentFrame;

pub mod eviction;
pub mod health;

pub use eviction::{EvictionAlert, RouteState, SelfEvictionController};
pub use health::{HealthProbe, HttpHealthProbe};

/// How one gateway session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Terminated(Option<String>),
    Disconnected,
}

pub struct EdgeAgent {
    gateway_url: String,
    auth_key: String,
    reconnect_delay: Duration,
    health_interval: Duration,
    controller: Arc<SelfEvictionController>,
    probe: Arc<dyn HealthProbe>,
}

impl EdgeAgent {
    pub fn new(
        config: &AgentConfig,
        controller: Arc<SelfEvictionController>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            gateway_url: config.gateway_url.clone(),
            auth_key: config.auth_key.clone(),
            reconnect_delay: config.reconnect_delay(),
            health_interval: config.health_interval(),
            controller,
            probe,
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(
        config: &AgentConfig,
        alerts: tokio::sync::mpsc::UnboundedSender<EvictionAlert>,
    ) -> anyhow::Result<Self> {
        let bird = BirdControl::new(&config.routing_socket).with_timeout(config.routing_timeout());
        let controller =
            Arc::new(SelfEvictionController::new(Arc::new(bird)).with_alerts(alerts));
        // Probe must finish well inside one check interval.
        let probe = HttpHealthProbe::new(&config.health_url, config.health_interval() / 2)?;
        Ok(Self::new(config, controller, Arc::new(probe)))
    }

    pub fn controller(&self) -> &Arc<SelfEvictionController> {
        &self.controller
    }

    /// Run the local health loop in the background.
    pub fn spawn_health_loop(&self) -> JoinHandle<()> {
        let controller = Arc::clone(&self.controller);
        let probe = Arc::clone(&self.probe);
        let interval = self.health_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let healthy = probe.check().await;
                debug!("Local health check: {}", if healthy { "ok" } else { "failing" });
                // Failures are already reported by the controller.
                let _ = controller.on_health(healthy).await;
            }
        })
    }

    /// Connect, reconnect on loss, and return once the coordinator
    /// terminates this node.
    pub async fn run(&self) -> anyhow::Result<()> {
        let health = self.spawn_health_loop();
        loop {
            match self.connect_once().await {
                Ok(SessionEnd::Terminated(reason)) => {
                    if let Err(e) = self.controller.revoke(reason.as_deref()).await {
                        error!("Self-eviction after terminate failed, retrying: {}", e);
                        self.wait_for_withdrawal().await;
                    }
                    break;
                }
                Ok(SessionEnd::Disconnected) => {
                    warn!("Gateway connection closed");
                }
                Err(e) => {
                    warn!("Gateway connection failed: {}", e);
                }
            }
            info!("Reconnecting in {:?}", self.reconnect_delay);
            tokio::time::sleep(self.reconnect_delay).await;
        }
        health.abort();
        Ok(())
    }

    /// Block until the route is confirmed withdrawn. The health loop keeps
    /// retrying an unconfirmed withdrawal of a revoked node.
    async fn wait_for_withdrawal(&self) {
        let mut state = self.controller.subscribe();
        while *state.borrow_and_update() != RouteState::Withdrawn {
            if state.changed().await.is_err() {
                break;
            }
        }
        info!("Withdrawal confirmed after terminate");
    }

    /// One gateway session: answer pings until the channel ends.
    pub async fn connect_once(&self) -> anyhow::Result<SessionEnd> {
        let mut request = self.gateway_url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(AUTH_HEADER, HeaderValue::from_str(&self.auth_key)?);

        info!("Connecting to control plane at {}", self.gateway_url);
        let (ws, _) = connect_async(request).await?;
        info!("Connected to control plane");
        let (mut sink, mut stream) = ws.split();

        while let Some(message) = stream.next().await {
            match message? {
                Message::Text(text) => match serde_json::from_str::<AgentFrame>(&text) {
                    Err(e) => warn!("Malformed frame from coordinator: {}", e),
                    Ok(AgentFrame::Ping) => {
                        debug!("ping");
                        let pong = serde_json::to_string(&AgentFrame::Pong)?;
                        sink.send(Message::Text(pong)).await?;
                    }
                    Ok(AgentFrame::Terminate { reason }) => {
                        warn!("Terminating connection: {:?}", reason);
                        let _ = sink.close().await;
                        return Ok(SessionEnd::Terminated(reason));
                    }
                    Ok(AgentFrame::Pong) => {}
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(SessionEnd::Disconnected)
    }
}
