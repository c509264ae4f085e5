//! Packetframe daemon entry point.

use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;

use packetframe::agent::{EdgeAgent, EvictionAlert};
use packetframe::config::{Config, Role};
use packetframe::coordinator::Coordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting Packetframe {:?}", cfg.role);

    let mut handle = match cfg.role {
        Role::Coordinator => {
            let listener = TcpListener::bind(cfg.coordinator.listen).await?;
            let coordinator = Coordinator::from_config(cfg.coordinator.clone())?;
            tokio::spawn(async move {
                if let Err(e) = coordinator.run(listener).await {
                    error!("Coordinator failed: {}", e);
                }
            })
        }
        Role::Agent => {
            info!("Using node ID {}", cfg.agent.node_id);

            // Operator channel for unconfirmed route changes
            let (alert_tx, mut alert_rx) = mpsc::unbounded_channel::<EvictionAlert>();
            let alerts = tokio::spawn(async move {
                while let Some(alert) = alert_rx.recv().await {
                    error!(
                        "OPERATOR ALERT: route `{}` unconfirmed at {}: {}",
                        alert.command, alert.at, alert.error
                    );
                }
            });

            let agent = EdgeAgent::from_config(&cfg.agent, alert_tx)?;
            tokio::spawn(async move {
                match agent.run().await {
                    Ok(()) => warn!("Edge agent terminated by coordinator"),
                    Err(e) => error!("Edge agent failed: {}", e),
                }
                // Flush alerts still queued by the controller.
                drop(agent);
                let _ = tokio::time::timeout(Duration::from_secs(1), alerts).await;
            })
        }
    };

    // Graceful Shutdown
    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        _ = &mut handle => info!("{:?} task exited", cfg.role),
    }

    handle.abort();
    info!("Shutdown complete.");
    Ok(())
}
