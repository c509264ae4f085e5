//! Coordinator HTTP listener.
//!
//! Serves the agent WebSocket (`/agent`) and the operational endpoints on
//! one port. Every JSON answer uses the `{success, message, data}`
//! envelope.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::error::ControlError;
use crate::fanout::FanoutBroadcaster;
use crate::gateway::{run_socket, HeartbeatGateway, AUTH_HEADER};
use crate::manifest::ManifestStore;
use crate::monitor::HealthMonitor;
use crate::registry::EdgeRegistry;
use crate::types::NodeId;

pub struct AppState {
    pub manifest: Arc<ManifestStore>,
    pub registry: Arc<EdgeRegistry>,
    pub gateway: Arc<HeartbeatGateway>,
    pub broadcaster: Arc<FanoutBroadcaster>,
    pub monitor: Arc<HealthMonitor>,
}

type HttpResponse = Response<Full<Bytes>>;

fn respond<T: Serialize>(status: StatusCode, message: &str, data: T) -> HttpResponse {
    let body = json!({
        "success": status.is_success(),
        "message": message,
        "data": data,
    });
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn respond_error(err: &ControlError) -> HttpResponse {
    let status = match err {
        ControlError::UnknownNode(_) => StatusCode::NOT_FOUND,
        ControlError::AuthorizationFailure => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    respond(status, &err.to_string(), serde_json::Value::Null)
}

pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    info!("Coordinator listening on {}", listener.local_addr()?);
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<HttpResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["agent"]) => handle_agent_upgrade(state, addr, req),
        (&Method::GET, ["ping"]) => {
            info!("Sending global ping");
            let probed = state.gateway.ping();
            respond(StatusCode::OK, "sent global ping", json!({ "probed": probed }))
        }
        (&Method::GET, ["connections"]) => respond(
            StatusCode::OK,
            "retrieved connections",
            state.gateway.list_connections(),
        ),
        (&Method::GET, ["health"]) => {
            respond(StatusCode::OK, "retrieved stale nodes", state.monitor.scan())
        }
        (&Method::GET, ["debug", "manifest"]) => respond(
            StatusCode::OK,
            "retrieved zone manifest",
            json!({ "zones": state.manifest.snapshot() }),
        ),
        (&Method::GET | &Method::POST, ["debug", "update"]) => {
            let manifest = state.manifest.snapshot();
            match state.broadcaster.update(&manifest).await {
                Ok(report) => respond(StatusCode::OK, "sent update", report),
                Err(e) => respond_error(&e),
            }
        }
        (&Method::POST, ["nodes", id, "authorize"]) => {
            let id = NodeId::from(*id);
            match state.registry.authorize(&id) {
                Ok(()) => respond(StatusCode::OK, "authorized node", json!({ "id": id })),
                Err(e) => respond_error(&e),
            }
        }
        (&Method::POST, ["nodes", id, "revoke"]) => {
            let id = NodeId::from(*id);
            match state.registry.revoke(&id) {
                Ok(()) => {
                    let terminated = state.gateway.terminate(&id, "authorization revoked");
                    respond(
                        StatusCode::OK,
                        "revoked node",
                        json!({ "id": id, "terminated": terminated }),
                    )
                }
                Err(e) => respond_error(&e),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "not found", serde_json::Value::Null),
    };
    Ok(response)
}

fn handle_agent_upgrade(
    state: Arc<AppState>,
    addr: SocketAddr,
    mut req: Request<Incoming>,
) -> HttpResponse {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return respond(
            StatusCode::BAD_REQUEST,
            "expected WebSocket upgrade",
            serde_json::Value::Null,
        );
    }

    let auth_key = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    info!("Edge agent connecting from {}", addr);

    match hyper_tungstenite::upgrade(&mut req, None) {
        Ok((response, websocket)) => {
            let gateway = Arc::clone(&state.gateway);
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => run_socket(gateway, ws, auth_key).await,
                    Err(e) => error!("WebSocket upgrade failed: {:?}", e),
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => {
            warn!("WebSocket upgrade error: {:?}", e);
            respond(
                StatusCode::BAD_REQUEST,
                &format!("WebSocket upgrade failed: {e}"),
                serde_json::Value::Null,
            )
        }
    }
}
