use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Agent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub role: Role,
    pub coordinator: CoordinatorConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    pub listen: SocketAddr,
    /// `https` in production; `http` only for lab fleets.
    pub push_scheme: String,
    pub push_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub stale_after_secs: u64,
    /// Send a terminate directive to connections of stale nodes. Agents
    /// treat that as revocation, so it is off unless asked for.
    pub terminate_stale: bool,
    /// Leave stale nodes out of manifest pushes.
    pub exclude_stale_from_fanout: bool,
    /// Initial zones and nodes, standing in for the persistence layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub node_id: String,
    pub auth_key: String,
    pub gateway_url: String,
    pub routing_socket: PathBuf,
    pub health_url: String,
    pub health_interval_secs: u64,
    pub routing_timeout_ms: u64,
    pub reconnect_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            push_scheme: "https".into(),
            push_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            stale_after_secs: 90,
            terminate_stale: false,
            exclude_stale_from_fanout: false,
            seed_file: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            auth_key: String::new(),
            gateway_url: "ws://127.0.0.1:8000/agent".into(),
            routing_socket: PathBuf::from(crate::routing::bird::DEFAULT_SOCKET),
            health_url: "http://127.0.0.1:2019/config/".into(),
            health_interval_secs: 5,
            routing_timeout_ms: 500,
            reconnect_secs: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Coordinator,
            coordinator: CoordinatorConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl AgentConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn routing_timeout(&self) -> Duration {
        Duration::from_millis(self.routing_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("packetframe.toml"))
                .merge(Json::file("packetframe.json"))
                .merge(Env::prefixed("PACKETFRAME_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("PACKETFRAME_AUTH_KEY_FILE") {
            config.agent.auth_key = std::fs::read_to_string(secret_file)?
                .trim()
                .to_string();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let c = &self.coordinator;
        if c.heartbeat_interval_secs == 0 || c.push_timeout_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs and push_timeout_secs must be positive");
        }
        if c.stale_after_secs <= c.heartbeat_interval_secs {
            anyhow::bail!(
                "stale_after_secs ({}) must exceed heartbeat_interval_secs ({})",
                c.stale_after_secs,
                c.heartbeat_interval_secs
            );
        }

        if self.role == Role::Agent {
            let a = &self.agent;
            if a.node_id.is_empty() || a.auth_key.is_empty() {
                anyhow::bail!("agent role requires agent.node_id and agent.auth_key");
            }
            if a.health_interval_secs == 0 || a.routing_timeout_ms == 0 || a.reconnect_secs == 0 {
                anyhow::bail!(
                    "health_interval_secs, routing_timeout_ms and reconnect_secs must be positive"
                );
            }
        }
        Ok(())
    }
}
