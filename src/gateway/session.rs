//! Per-connection state machine.
//!
//! ```text
//! Connecting --handshake--> Authorizing --authorize--> Active --disconnect--> Closed
//!                                      \--(unknown)--> Rejected
//! ```
//!
//! Transitions are looked up by event kind in [`transition_for`]; each one
//! takes the current state and returns the next. An event that does not
//! apply to the current state leaves it unchanged.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::{ConnectionId, HeartbeatGateway};
use crate::types::{AgentFrame, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authorizing { auth_key: Option<String> },
    Active { node_id: NodeId },
    Rejected,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Rejected | SessionState::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transport accepted; carries the identity header, if any.
    Handshake { auth_key: Option<String> },
    /// Resolve the presented identity against the registry.
    Authorize,
    /// Liveness reply from the agent.
    Pong,
    /// Transport went away.
    Disconnect { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Handshake,
    Authorize,
    Pong,
    Disconnect,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Handshake { .. } => EventKind::Handshake,
            SessionEvent::Authorize => EventKind::Authorize,
            SessionEvent::Pong => EventKind::Pong,
            SessionEvent::Disconnect { .. } => EventKind::Disconnect,
        }
    }
}

/// Everything a transition may touch besides the state itself.
pub struct SessionContext<'a> {
    pub gateway: &'a HeartbeatGateway,
    pub connection_id: ConnectionId,
    pub outbound: &'a mpsc::UnboundedSender<AgentFrame>,
    pub now: DateTime<Utc>,
}

pub type Transition = fn(SessionState, SessionEvent, &SessionContext<'_>) -> SessionState;

pub fn transition_for(kind: EventKind) -> Transition {
    match kind {
        EventKind::Handshake => on_handshake,
        EventKind::Authorize => on_authorize,
        EventKind::Pong => on_pong,
        EventKind::Disconnect => on_disconnect,
    }
}

fn on_handshake(state: SessionState, event: SessionEvent, _: &SessionContext<'_>) -> SessionState {
    match (state, event) {
        (SessionState::Connecting, SessionEvent::Handshake { auth_key }) => {
            SessionState::Authorizing { auth_key }
        }
        (state, _) => state,
    }
}

fn on_authorize(state: SessionState, _: SessionEvent, ctx: &SessionContext<'_>) -> SessionState {
    let SessionState::Authorizing { auth_key } = state else {
        return state;
    };

    let node_id = auth_key
        .as_deref()
        .ok_or(crate::error::ControlError::AuthorizationFailure)
        .and_then(|key| ctx.gateway.registry().authenticate(key));

    match node_id {
        Ok(node_id) => {
            info!("Edge agent {} connected ({})", node_id, ctx.connection_id);
            ctx.gateway
                .attach(ctx.connection_id, node_id.clone(), ctx.now, ctx.outbound.clone());
            SessionState::Active { node_id }
        }
        Err(e) => {
            warn!("Rejecting connection {}: {}", ctx.connection_id, e);
            let _ = ctx
                .outbound
                .send(AgentFrame::terminate("Node not found or not allowed"));
            SessionState::Rejected
        }
    }
}

fn on_pong(state: SessionState, _: SessionEvent, ctx: &SessionContext<'_>) -> SessionState {
    match state {
        SessionState::Active { node_id } => {
            debug!("Received pong from {}", node_id);
            ctx.gateway.record_message(ctx.connection_id, &node_id, ctx.now);
            SessionState::Active { node_id }
        }
        state => {
            debug!("Ignoring pong on {} in state {:?}", ctx.connection_id, state);
            state
        }
    }
}

fn on_disconnect(state: SessionState, event: SessionEvent, ctx: &SessionContext<'_>) -> SessionState {
    let reason = match event {
        SessionEvent::Disconnect { reason } => reason,
        _ => String::new(),
    };
    match state {
        SessionState::Active { node_id } => {
            info!("Edge agent {} disconnected: {}", node_id, reason);
            ctx.gateway.detach(ctx.connection_id);
            SessionState::Closed
        }
        SessionState::Rejected => SessionState::Rejected,
        _ => SessionState::Closed,
    }
}

/// One accepted agent connection.
pub struct Session<'g> {
    gateway: &'g HeartbeatGateway,
    connection_id: ConnectionId,
    outbound: mpsc::UnboundedSender<AgentFrame>,
    state: SessionState,
}

impl<'g> Session<'g> {
    pub(super) fn new(
        gateway: &'g HeartbeatGateway,
        outbound: mpsc::UnboundedSender<AgentFrame>,
    ) -> Self {
        Self {
            gateway,
            connection_id: ConnectionId::new_v4(),
            outbound,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn handle(&mut self, event: SessionEvent) -> &SessionState {
        self.handle_at(event, Utc::now())
    }

    pub fn handle_at(&mut self, event: SessionEvent, now: DateTime<Utc>) -> &SessionState {
        let ctx = SessionContext {
            gateway: self.gateway,
            connection_id: self.connection_id,
            outbound: &self.outbound,
            now,
        };
        let transition = transition_for(event.kind());
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        self.state = transition(state, event, &ctx);
        &self.state
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        // Active never outlives the session, however the driver exits.
        if matches!(self.state, SessionState::Active { .. }) {
            self.gateway.detach(self.connection_id);
        }
    }
}
