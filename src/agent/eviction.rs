//! Binds the node's health to its anycast announcement.
//!
//! Withdrawal is triggered either by a failed local health check or by a
//! terminate directive from the coordinator. A terminate is a revocation:
//! once received, the route is never re-announced by this controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{ControlError, Result};
use crate::routing::{RouteCommand, RoutingControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    Announced,
    Withdrawn,
    /// A withdrawal was requested but the daemon did not confirm it. The
    /// node may still attract traffic; new traffic-dependent work must stop.
    Unconfirmed,
}

/// Operator notification for a withdrawal or re-announcement that could
/// not be confirmed.
#[derive(Debug, Clone, Serialize)]
pub struct EvictionAlert {
    pub command: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

pub struct SelfEvictionController {
    routing: Arc<dyn RoutingControl>,
    state: watch::Sender<RouteState>,
    revoked: AtomicBool,
    alerts: Option<mpsc::UnboundedSender<EvictionAlert>>,
    // one daemon exchange at a time
    command_lock: Mutex<()>,
}

impl SelfEvictionController {
    pub fn new(routing: Arc<dyn RoutingControl>) -> Self {
        let (state, _) = watch::channel(RouteState::Announced);
        Self {
            routing,
            state,
            revoked: AtomicBool::new(false),
            alerts: None,
            command_lock: Mutex::new(()),
        }
    }

    pub fn with_alerts(mut self, alerts: mpsc::UnboundedSender<EvictionAlert>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<RouteState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RouteState {
        *self.state.borrow()
    }

    /// Whether this node should keep taking traffic-dependent work.
    pub fn accepting_traffic(&self) -> bool {
        self.state() == RouteState::Announced
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Withdraw the anycast route. Safe to repeat.
    pub async fn withdraw(&self) -> Result<RouteState> {
        let _guard = self.command_lock.lock().await;
        match self.routing.send(RouteCommand::Down).await {
            Ok(_) => {
                self.state.send_replace(RouteState::Withdrawn);
                info!("Anycast route withdrawn");
                Ok(RouteState::Withdrawn)
            }
            Err(e) => {
                self.state.send_replace(RouteState::Unconfirmed);
                self.report(RouteCommand::Down, &e);
                Err(e)
            }
        }
    }

    /// Re-announce the route. Skipped once the node has been revoked.
    pub async fn announce(&self) -> Result<RouteState> {
        let _guard = self.command_lock.lock().await;
        if self.is_revoked() {
            warn!("Not re-announcing: node authorization was revoked");
            return Ok(self.state());
        }
        match self.routing.send(RouteCommand::Up).await {
            Ok(_) => {
                self.state.send_replace(RouteState::Announced);
                info!("Anycast route announced");
                Ok(RouteState::Announced)
            }
            Err(e) => {
                self.report(RouteCommand::Up, &e);
                Err(e)
            }
        }
    }

    /// Handle a terminate directive from the coordinator.
    pub async fn revoke(&self, reason: Option<&str>) -> Result<RouteState> {
        self.revoked.store(true, Ordering::SeqCst);
        warn!(
            "Terminate received from coordinator: {}",
            reason.unwrap_or("no reason given")
        );
        self.withdraw().await
    }

    /// Feed one local health check result. Only state changes reach the
    /// daemon. An unconfirmed withdrawal is retried on every failed check,
    /// and on every check at all once the node is revoked.
    pub async fn on_health(&self, healthy: bool) -> Result<RouteState> {
        match (healthy, self.state()) {
            (_, RouteState::Unconfirmed) if self.is_revoked() => {
                warn!("Retrying withdrawal of revoked node");
                self.withdraw().await
            }
            (false, RouteState::Announced | RouteState::Unconfirmed) => {
                warn!("Local health check failed, withdrawing route");
                self.withdraw().await
            }
            (true, RouteState::Withdrawn | RouteState::Unconfirmed) if !self.is_revoked() => {
                info!("Local health check passed again, re-announcing route");
                self.announce().await
            }
            (_, state) => Ok(state),
        }
    }

    fn report(&self, command: RouteCommand, err: &ControlError) {
        error!("Route `{}` not confirmed: {}", command, err);
        if let Some(alerts) = &self.alerts {
            let _ = alerts.send(EvictionAlert {
                command: command.token().to_string(),
                error: err.to_string(),
                at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    /// Daemon double that records commands and fails on demand.
    #[derive(Default)]
    struct FakeDaemon {
        sent: StdMutex<Vec<RouteCommand>>,
        fail: StdMutex<Option<ControlError>>,
    }

    impl FakeDaemon {
        fn fail_next(&self, err: ControlError) {
            *self.fail.lock().unwrap() = Some(err);
        }

        fn sent(&self) -> Vec<RouteCommand> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RoutingControl for FakeDaemon {
        async fn send(&self, command: RouteCommand) -> Result<String> {
            self.sent.lock().unwrap().push(command);
            match self.fail.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok("0000 ok".to_string()),
            }
        }
    }

    fn unavailable() -> ControlError {
        ControlError::RoutingDaemonUnavailable {
            path: PathBuf::from("/run/bird/bird.ctl"),
            reason: "connect: no such file".into(),
        }
    }

    #[tokio::test]
    async fn test_withdraw_is_idempotent() {
        let daemon = Arc::new(FakeDaemon::default());
        let controller = SelfEvictionController::new(daemon.clone());

        assert_eq!(controller.withdraw().await.unwrap(), RouteState::Withdrawn);
        assert_eq!(controller.withdraw().await.unwrap(), RouteState::Withdrawn);
        assert_eq!(controller.state(), RouteState::Withdrawn);

        assert_eq!(controller.announce().await.unwrap(), RouteState::Announced);
        assert_eq!(controller.announce().await.unwrap(), RouteState::Announced);
        assert_eq!(
            daemon.sent(),
            vec![
                RouteCommand::Down,
                RouteCommand::Down,
                RouteCommand::Up,
                RouteCommand::Up
            ]
        );
    }

    #[tokio::test]
    async fn test_terminate_withdraws_and_stops_traffic() {
        let daemon = Arc::new(FakeDaemon::default());
        let controller = SelfEvictionController::new(daemon.clone());
        let mut watcher = controller.subscribe();
        assert!(controller.accepting_traffic());

        let state = controller.revoke(Some("revoked")).await.unwrap();

        assert_eq!(state, RouteState::Withdrawn);
        assert!(!controller.accepting_traffic());
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), RouteState::Withdrawn);

        // Recovery after revocation never re-announces.
        assert_eq!(controller.on_health(true).await.unwrap(), RouteState::Withdrawn);
        assert_eq!(controller.announce().await.unwrap(), RouteState::Withdrawn);
        assert_eq!(daemon.sent(), vec![RouteCommand::Down]);
    }

    #[tokio::test]
    async fn test_health_transitions() {
        let daemon = Arc::new(FakeDaemon::default());
        let controller = SelfEvictionController::new(daemon.clone());

        assert_eq!(controller.on_health(true).await.unwrap(), RouteState::Announced);
        assert_eq!(controller.on_health(false).await.unwrap(), RouteState::Withdrawn);
        assert_eq!(controller.on_health(false).await.unwrap(), RouteState::Withdrawn);
        assert_eq!(controller.on_health(true).await.unwrap(), RouteState::Announced);

        assert_eq!(daemon.sent(), vec![RouteCommand::Down, RouteCommand::Up]);
    }

    #[tokio::test]
    async fn test_failed_withdraw_is_surfaced_and_retried() {
        let daemon = Arc::new(FakeDaemon::default());
        let (alerts_tx, mut alerts_rx) = mpsc::unbounded_channel();
        let controller = SelfEvictionController::new(daemon.clone()).with_alerts(alerts_tx);

        daemon.fail_next(unavailable());
        let err = controller.on_health(false).await.unwrap_err();
        assert!(err.is_routing_failure());
        assert_eq!(controller.state(), RouteState::Unconfirmed);
        assert!(!controller.accepting_traffic());

        let alert = alerts_rx.try_recv().unwrap();
        assert_eq!(alert.command, "down");
        assert!(alert.error.contains("unavailable"));

        // Next failed check retries the withdrawal.
        assert_eq!(controller.on_health(false).await.unwrap(), RouteState::Withdrawn);
        assert_eq!(daemon.sent(), vec![RouteCommand::Down, RouteCommand::Down]);
    }

    #[tokio::test]
    async fn test_revoked_withdrawal_retried_while_healthy() {
        let daemon = Arc::new(FakeDaemon::default());
        let controller = SelfEvictionController::new(daemon.clone());

        daemon.fail_next(unavailable());
        assert!(controller.revoke(Some("revoked")).await.is_err());
        assert_eq!(controller.state(), RouteState::Unconfirmed);

        assert_eq!(controller.on_health(true).await.unwrap(), RouteState::Withdrawn);
        assert_eq!(controller.on_health(true).await.unwrap(), RouteState::Withdrawn);
        assert_eq!(daemon.sent(), vec![RouteCommand::Down, RouteCommand::Down]);
    }

    #[tokio::test]
    async fn test_daemon_error_reply_on_announce() {
        let daemon = Arc::new(FakeDaemon::default());
        let controller = SelfEvictionController::new(daemon.clone());
        controller.withdraw().await.unwrap();

        daemon.fail_next(ControlError::RoutingDaemonError {
            command: "up".into(),
            reply: "9001 busy".into(),
        });
        assert!(matches!(
            controller.announce().await,
            Err(ControlError::RoutingDaemonError { .. })
        ));
        assert_eq!(controller.state(), RouteState::Withdrawn);
    }
}
