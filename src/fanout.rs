//! Manifest fan-out to the edge fleet.
//!
//! Every authorized node gets one independent POST of the manifest. Each
//! push runs as its own task with its own result slot, and the broadcast
//! only returns once every task has finished. A failing or slow node is
//! recorded in its own [`FanoutResult`] and never holds up the others
//! beyond the per-node timeout. There are no retries here; callers decide.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::future::join_all;
use log::{debug, info, warn};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;

use crate::error::{ControlError, Result};
use crate::registry::EdgeRegistry;
use crate::types::{EdgeNode, ManifestEntry, NodeId};

/// Default per-node push budget.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers a serialized manifest to one node and reports the HTTP status.
#[async_trait]
pub trait ManifestTransport: Send + Sync {
    async fn push(&self, node: &EdgeNode, body: Bytes) -> Result<u16>;
}

/// HTTPS push to `{scheme}://{endpoint}/update`.
///
/// Edge nodes serve self-signed certificates on the internal fleet
/// network, so certificate verification is disabled for this client only.
pub struct HttpsTransport {
    client: reqwest::Client,
    scheme: String,
}

impl HttpsTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_scheme("https", timeout)
    }

    pub fn with_scheme(scheme: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            scheme: scheme.into(),
        })
    }

    fn update_url(&self, node: &EdgeNode) -> String {
        format!("{}://{}/update", self.scheme, node.endpoint)
    }
}

#[async_trait]
impl ManifestTransport for HttpsTransport {
    async fn push(&self, node: &EdgeNode, body: Bytes) -> Result<u16> {
        let url = self.update_url(node);
        debug!("Sending HTTP POST to {}", url);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ControlError::TransportFailure {
                node: node.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(response.status().as_u16())
    }
}

/// What happened to one node's push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOutcome {
    /// The node answered; any status, including non-2xx.
    Status(u16),
    /// No HTTP answer: connect failure, TLS failure, or timeout.
    TransportError(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FanoutResult {
    pub node_id: NodeId,
    pub outcome: PushOutcome,
    #[serde(serialize_with = "serialize_millis")]
    pub latency: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl FanoutResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PushOutcome::Status(code) if (200..300).contains(&code))
    }

    /// The failure as a [`ControlError::TransportFailure`], if it failed.
    pub fn error(&self) -> Option<ControlError> {
        let reason = match &self.outcome {
            PushOutcome::Status(code) if (200..300).contains(code) => return None,
            PushOutcome::Status(code) => format!("HTTP status {code}"),
            PushOutcome::TransportError(reason) => reason.clone(),
        };
        Some(ControlError::TransportFailure {
            node: self.node_id.clone(),
            reason,
        })
    }
}

/// Aggregate of one broadcast, one entry per node in the snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanoutReport {
    pub results: Vec<FanoutResult>,
}

impl FanoutReport {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }
}

pub struct FanoutBroadcaster {
    registry: Arc<EdgeRegistry>,
    transport: Arc<dyn ManifestTransport>,
    timeout: Duration,
    exclude_stale: Option<Duration>,
}

impl FanoutBroadcaster {
    pub fn new(registry: Arc<EdgeRegistry>, transport: Arc<dyn ManifestTransport>) -> Self {
        Self {
            registry,
            transport,
            timeout: DEFAULT_PUSH_TIMEOUT,
            exclude_stale: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Skip nodes whose last heartbeat is older than `threshold`.
    pub fn with_stale_exclusion(mut self, threshold: Duration) -> Self {
        self.exclude_stale = Some(threshold);
        self
    }

    /// Nodes targeted by a broadcast started now.
    fn targets(&self) -> Vec<EdgeNode> {
        let nodes = self.registry.authorized_snapshot();
        let Some(threshold) = self.exclude_stale else {
            return nodes;
        };
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        nodes
            .into_iter()
            .filter(|node| {
                let fresh = node.last_seen.is_some_and(|seen| now - seen <= threshold);
                if !fresh {
                    debug!("Excluding stale node {} from fan-out", node.id);
                }
                fresh
            })
            .collect()
    }

    /// Push `manifest` to every authorized node and wait for all of them.
    pub async fn update(&self, manifest: &[ManifestEntry]) -> Result<FanoutReport> {
        let body = Bytes::from(serde_json::to_vec(manifest)?);
        let targets = self.targets();
        info!(
            "Pushing manifest ({} zones) to {} nodes",
            manifest.len(),
            targets.len()
        );

        let handles: Vec<_> = targets
            .into_iter()
            .map(|node| {
                let transport = Arc::clone(&self.transport);
                let body = body.clone();
                let timeout = self.timeout;
                let node_id = node.id.clone();
                let handle = tokio::spawn(async move {
                    let started = Instant::now();
                    let outcome =
                        match tokio::time::timeout(timeout, transport.push(&node, body)).await {
                            Ok(Ok(status)) => PushOutcome::Status(status),
                            Ok(Err(ControlError::TransportFailure { reason, .. })) => {
                                PushOutcome::TransportError(reason)
                            }
                            Ok(Err(e)) => PushOutcome::TransportError(e.to_string()),
                            Err(_) => PushOutcome::TransportError(format!(
                                "timed out after {}ms",
                                timeout.as_millis()
                            )),
                        };
                    FanoutResult {
                        node_id: node.id,
                        outcome,
                        latency: started.elapsed(),
                    }
                });
                (node_id, handle)
            })
            .collect();

        let (ids, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let joined = join_all(handles).await;

        let results: Vec<FanoutResult> = ids
            .into_iter()
            .zip(joined)
            .map(|(node_id, joined)| match joined {
                Ok(result) => result,
                Err(e) => FanoutResult {
                    node_id,
                    outcome: PushOutcome::TransportError(format!("push task failed: {e}")),
                    latency: Duration::ZERO,
                },
            })
            .collect();

        for result in &results {
            if let Some(err) = result.error() {
                warn!("{}", err);
            }
        }

        let report = FanoutReport { results };
        info!(
            "Manifest push finished: {} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }
}
