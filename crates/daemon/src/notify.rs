//! Delivery of lease coordinates to the remote tunnel peer.

use async_trait::async_trait;
use common::{LeaseResult, TeardownNotice};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("peer rejected notification: {0}")]
    Rejected(String),
}

/// What to do when the remote peer cannot be notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum NotifyPolicy {
    /// Surface the failure to the caller; the lease stays live.
    Strict,
    /// Log the failure and report success for the lease itself.
    Permissive,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn tunnel_ready(&self, lease: &LeaseResult) -> Result<(), NotifyError>;

    async fn tunnel_closed(&self, notice: &TeardownNotice) -> Result<(), NotifyError>;
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn tunnel_ready(&self, lease: &LeaseResult) -> Result<(), NotifyError> {
        tracing::debug!(port = lease.port, node_id = %lease.node_id, "No notifier configured");
        Ok(())
    }

    async fn tunnel_closed(&self, notice: &TeardownNotice) -> Result<(), NotifyError> {
        tracing::debug!(node_id = %notice.node_id, "No notifier configured");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectRequest<'a, T> {
    tenant_id: &'a str,
    doc: &'a T,
}

/// Posts `{tenantId, doc}` messages to the service that relays them to edge
/// nodes (`<base>/setupSSHTunneling`, `<base>/teardownSSHTunneling`).
pub struct WebhookNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl WebhookNotifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, tenant_id: &str, doc: &T) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .json(&ObjectRequest { tenant_id, doc })
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(resp.status().to_string()))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn tunnel_ready(&self, lease: &LeaseResult) -> Result<(), NotifyError> {
        self.post("setupSSHTunneling", &lease.tenant_id, lease).await
    }

    async fn tunnel_closed(&self, notice: &TeardownNotice) -> Result<(), NotifyError> {
        self.post("teardownSSHTunneling", &notice.tenant_id, notice).await
    }
}
