//! DNS alias records pointing custom hostnames at the broker's ingress host.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AliasError {
    #[error("dns provider rejected {host}: {reason}")]
    Rejected { host: String, reason: String },

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait AliasManager: Send + Sync {
    /// Upsert an alias record for `host` targeting `target`.
    async fn publish(&self, host: &str, target: &str) -> Result<(), AliasError>;

    /// Delete the alias record for `host`.
    async fn retract(&self, host: &str, target: &str) -> Result<(), AliasError>;
}

/// Used when no DNS provider is configured.
pub struct NoopAliases;

#[async_trait]
impl AliasManager for NoopAliases {
    async fn publish(&self, host: &str, target: &str) -> Result<(), AliasError> {
        tracing::debug!(host, target, "No DNS provider configured, alias not published");
        Ok(())
    }

    async fn retract(&self, host: &str, target: &str) -> Result<(), AliasError> {
        tracing::debug!(host, target, "No DNS provider configured, alias not retracted");
        Ok(())
    }
}

/// Keeps alias records in memory.
#[derive(Default)]
pub struct MemoryAliases {
    records: Mutex<BTreeMap<String, String>>,
    reject: Mutex<bool>,
}

impl MemoryAliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_of(&self, host: &str) -> Option<String> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject every subsequent call.
    pub fn reject_all(&self, reject: bool) {
        *self.reject.lock().unwrap_or_else(|e| e.into_inner()) = reject;
    }

    fn check(&self, host: &str) -> Result<(), AliasError> {
        if *self.reject.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(AliasError::Rejected {
                host: host.to_string(),
                reason: "provider unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AliasManager for MemoryAliases {
    async fn publish(&self, host: &str, target: &str) -> Result<(), AliasError> {
        self.check(host)?;
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host.to_string(), target.to_string());
        Ok(())
    }

    async fn retract(&self, host: &str, _target: &str) -> Result<(), AliasError> {
        self.check(host)?;
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(host);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AliasRecord {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    target: String,
}

/// Manages CNAME records through a DNS provider's HTTP API:
/// `PUT <base>/records/<host>` upserts, `DELETE <base>/records/<host>` removes.
pub struct WebhookAliases {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl WebhookAliases {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, AliasError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, host: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/records/{}", self.base_url, host));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl AliasManager for WebhookAliases {
    async fn publish(&self, host: &str, target: &str) -> Result<(), AliasError> {
        let record = AliasRecord {
            kind: "CNAME".to_string(),
            name: host.to_string(),
            target: target.to_string(),
        };
        let resp = self.request(reqwest::Method::PUT, host).json(&record).send().await?;
        if !resp.status().is_success() {
            return Err(AliasError::Rejected {
                host: host.to_string(),
                reason: resp.status().to_string(),
            });
        }
        tracing::info!(host, target, "Published DNS alias");
        Ok(())
    }

    async fn retract(&self, host: &str, target: &str) -> Result<(), AliasError> {
        let resp = self.request(reqwest::Method::DELETE, host).send().await?;
        match resp.status() {
            status if status.is_success() => {
                tracing::info!(host, target, "Retracted DNS alias");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                tracing::debug!(host, "DNS alias already gone");
                Ok(())
            }
            status => Err(AliasError::Rejected {
                host: host.to_string(),
                reason: status.to_string(),
            }),
        }
    }
}
