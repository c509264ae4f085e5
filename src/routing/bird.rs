use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use super::{RouteCommand, RoutingControl};
use crate::error::{ControlError, Result};

/// Default BIRD control socket.
pub const DEFAULT_SOCKET: &str = "/run/bird/bird.ctl";

/// Default budget for one connect + command + reply exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// BIRD control socket client.
///
/// Each command uses its own short-lived connection: connect, write the
/// command token, read one reply, close.
pub struct BirdControl {
    socket_path: PathBuf,
    timeout: Duration,
}

impl BirdControl {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn unavailable(&self, reason: impl Into<String>) -> ControlError {
        ControlError::RoutingDaemonUnavailable {
            path: self.socket_path.clone(),
            reason: reason.into(),
        }
    }

    async fn exchange(&self, command: RouteCommand) -> Result<String> {
        let mut conn = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| self.unavailable(format!("connect: {e}")))?;

        conn.write_all(command.token().as_bytes())
            .await
            .map_err(|e| self.unavailable(format!("write: {e}")))?;

        let mut buf = [0u8; 1024];
        let n = conn
            .read(&mut buf)
            .await
            .map_err(|e| self.unavailable(format!("read: {e}")))?;

        let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
        debug!("bird response to {}: {:?}", command, reply);
        check_reply(command, &reply)
    }
}

/// Classify a daemon reply. BIRD reports failures with 8xxx/9xxx codes.
fn check_reply(command: RouteCommand, reply: &str) -> Result<String> {
    let reply = reply.trim();
    let failed = reply.is_empty()
        || reply.starts_with('8')
        || reply.starts_with('9')
        || reply.to_ascii_lowercase().starts_with("err");
    if failed {
        return Err(ControlError::RoutingDaemonError {
            command: command.token().to_string(),
            reply: if reply.is_empty() {
                "empty reply".to_string()
            } else {
                reply.to_string()
            },
        });
    }
    Ok(reply.to_string())
}

#[async_trait]
impl RoutingControl for BirdControl {
    async fn send(&self, command: RouteCommand) -> Result<String> {
        let ack = timeout(self.timeout, self.exchange(command))
            .await
            .map_err(|_| {
                self.unavailable(format!("no reply within {}ms", self.timeout.as_millis()))
            })??;
        info!("Routing daemon acknowledged `{}`: {}", command, ack);
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::net::UnixListener;

    /// Serve `replies` in order, one per connection, returning what was
    /// received.
    fn fake_daemon(
        path: &Path,
        replies: Vec<&'static str>,
    ) -> tokio::task::JoinHandle<Vec<String>> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let mut received = Vec::new();
            for reply in replies {
                let (mut conn, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 64];
                let n = conn.read(&mut buf).await.unwrap();
                received.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                conn.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        })
    }

    #[tokio::test]
    async fn test_down_and_up_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bird.ctl");
        let daemon = fake_daemon(&path, vec!["0000 route withdrawn\n", "0000 route announced\n"]);
        let bird = BirdControl::new(&path);

        assert_eq!(bird.send(RouteCommand::Down).await.unwrap(), "0000 route withdrawn");
        assert_eq!(bird.send(RouteCommand::Up).await.unwrap(), "0000 route announced");
        assert_eq!(daemon.await.unwrap(), vec!["down", "up"]);
    }

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let bird = BirdControl::new(dir.path().join("absent.ctl"));

        let err = bird.send(RouteCommand::Down).await.unwrap_err();
        assert!(matches!(err, ControlError::RoutingDaemonUnavailable { .. }));
        assert!(err.is_routing_failure());
    }

    #[tokio::test]
    async fn test_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bird.ctl");
        let _daemon = fake_daemon(&path, vec!["9001 protocol not found\n"]);
        let bird = BirdControl::new(&path);

        match bird.send(RouteCommand::Down).await.unwrap_err() {
            ControlError::RoutingDaemonError { command, reply } => {
                assert_eq!(command, "down");
                assert_eq!(reply, "9001 protocol not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silent_daemon_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bird.ctl");
        let listener = UnixListener::bind(&path).unwrap();
        let _hold = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(conn);
        });
        let bird = BirdControl::new(&path).with_timeout(Duration::from_millis(100));

        let err = bird.send(RouteCommand::Down).await.unwrap_err();
        assert!(matches!(err, ControlError::RoutingDaemonUnavailable { .. }));
    }

    #[test]
    fn test_check_reply() {
        assert!(check_reply(RouteCommand::Up, "ok").is_ok());
        assert!(check_reply(RouteCommand::Up, "0000 already up").is_ok());
        assert!(check_reply(RouteCommand::Up, "").is_err());
        assert!(check_reply(RouteCommand::Up, "ERROR: busy").is_err());
        assert!(check_reply(RouteCommand::Up, "8003 no such protocol").is_err());
    }
}
