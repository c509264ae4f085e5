use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{HeartbeatGateway, SessionEvent, SessionState};
use crate::types::AgentFrame;

/// Identity header an agent presents on the WebSocket handshake
/// (`X-Packetframe-Eca-Auth`).
pub const AUTH_HEADER: &str = "x-packetframe-eca-auth";

/// Drive one agent WebSocket until it closes or is terminated.
pub async fn run_socket<S>(
    gateway: Arc<HeartbeatGateway>,
    ws: WebSocketStream<S>,
    auth_key: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = gateway.open_session(tx);

    session.handle(SessionEvent::Handshake { auth_key });
    session.handle(SessionEvent::Authorize);

    let mut reason = String::from("closed by coordinator");
    while !session.state().is_terminal() {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let terminate = matches!(frame, AgentFrame::Terminate { .. });
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    reason = format!("write failed: {e}");
                    break;
                }
                if terminate {
                    reason = String::from("terminated");
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<AgentFrame>(&text) {
                    Ok(AgentFrame::Pong) => {
                        session.handle(SessionEvent::Pong);
                    }
                    Ok(other) => debug!("Ignoring {:?} from agent", other),
                    Err(e) => warn!("Malformed frame on {}: {}", session.connection_id(), e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    reason = String::from("closed by agent");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    reason = format!("transport error: {e}");
                    break;
                }
            }
        }
    }

    // A rejected session still owes the agent its terminate notice.
    if *session.state() == SessionState::Rejected {
        while let Ok(frame) = rx.try_recv() {
            if send_frame(&mut sink, &frame).await.is_err() {
                break;
            }
        }
    }

    session.handle(SessionEvent::Disconnect { reason });
    let _ = sink.close().await;
}

async fn send_frame<S>(
    sink: &mut futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
    frame: &AgentFrame,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = serde_json::to_string(frame).unwrap_or_else(|_| String::from("{}"));
    sink.send(Message::Text(text)).await
}
