use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of a lease: one per (tenant, target node, endpoint).
/// An empty endpoint means a raw TCP (SSH) tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseKey {
    pub tenant_id: String,
    pub node_id: String,
    #[serde(default)]
    pub endpoint: String,
}

impl LeaseKey {
    pub fn new(tenant_id: impl Into<String>, node_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            node_id: node_id.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn is_http(&self) -> bool {
        !self.endpoint.is_empty()
    }

    /// Path segment (without leading slash) under which an HTTP lease is exposed.
    pub fn proxy_endpoint_path(&self) -> String {
        format!("{}-{}", self.node_id, self.endpoint.replace(':', "."))
    }
}

impl std::fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.endpoint.is_empty() {
            write!(f, "{}/{}", self.tenant_id, self.node_id)
        } else {
            write!(f, "{}/{}/{}", self.tenant_id, self.node_id, self.endpoint)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Allowed,
    Denied,
}

/// What the upstream RBAC / entity layer already established about the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    pub tenant_id: String,
    pub capability: Capability,
    #[serde(default = "default_true")]
    pub tunneling_enabled: bool,
    #[serde(default)]
    pub cli_ssh_allowed: bool,
    #[serde(default)]
    pub node_connected: Option<bool>,
    /// Set by the HTTP service proxy flow, which carries its own access rules.
    #[serde(default)]
    pub service_proxy: bool,
}

fn default_true() -> bool {
    true
}

impl CallerContext {
    pub fn allowed(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            capability: Capability::Allowed,
            tunneling_enabled: true,
            cli_ssh_allowed: true,
            node_connected: None,
            service_proxy: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderOverride {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub node_id: String,
    #[serde(default)]
    pub endpoint: String,
    /// Existing public key to keep when refreshing a lease.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    /// Generate basic auth credentials when none are supplied.
    #[serde(default)]
    pub generate_basic_auth: bool,
    #[serde(default)]
    pub dns_alias: Option<String>,
    /// Publish the alias derived from the proxy URL base instead of an explicit one.
    #[serde(default)]
    pub derive_dns_alias: bool,
    #[serde(default)]
    pub rewrite_rules_disabled: bool,
    #[serde(default)]
    pub header_overrides: Vec<HeaderOverride>,
    /// The node endpoint speaks TLS. HTTP endpoints only.
    #[serde(default)]
    pub tls_endpoint: bool,
    /// Accept the endpoint's certificate without verification; only
    /// meaningful together with `tls_endpoint`.
    #[serde(default)]
    pub skip_cert_verification: bool,
}

impl SetupRequest {
    pub fn tcp(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn http(node_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn key(&self, tenant_id: &str) -> LeaseKey {
        LeaseKey::new(tenant_id, self.node_id.clone(), self.endpoint.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownRequest {
    pub node_id: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

impl TeardownRequest {
    pub fn key(&self, tenant_id: &str) -> LeaseKey {
        LeaseKey::new(tenant_id, self.node_id.clone(), self.endpoint.clone())
    }
}

impl From<&SetupRequest> for TeardownRequest {
    fn from(req: &SetupRequest) -> Self {
        Self {
            node_id: req.node_id.clone(),
            endpoint: req.endpoint.clone(),
            public_key: req.public_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseResult {
    pub tenant_id: String,
    pub node_id: String,
    #[serde(default)]
    pub endpoint: String,
    pub port: u16,
    pub public_key: String,
    /// Only present when the broker minted a new keypair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default)]
    pub tls_endpoint: bool,
    #[serde(default)]
    pub skip_cert_verification: bool,
}

/// Payload pushed to the remote peer when a tunnel is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownNotice {
    pub tenant_id: String,
    pub node_id: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub public_key: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseView {
    pub port: u16,
    pub key: LeaseKey,
    pub state: String,
    pub allocated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub candidates: usize,
    pub reclaimed: Vec<u16>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupEnvelope {
    pub context: CallerContext,
    pub request: SetupRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownEnvelope {
    pub context: CallerContext,
    pub request: TeardownRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// `https://wst-ns.example.com` + `node-svc.80` -> `https://wst-ns.example.com/node-svc.80`
pub fn proxy_url(base: &str, endpoint_path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), endpoint_path)
}

/// Per-endpoint DNS name: `https://wst-ns-<hash>.example.com`.
///
/// The endpoint path is hashed because it may contain dots and a DNS label
/// holds at most 63 characters.
pub fn derived_dns_url(base: &str, endpoint_path: &str) -> String {
    let base = base.trim_end_matches('/');
    let digest = hex::encode(Sha256::digest(endpoint_path.as_bytes()));
    let hash = &digest[..32];
    let host_start = base.find("://").map(|i| i + 3).unwrap_or(0);
    match base[host_start..].find('.') {
        Some(i) => {
            let (prefix, suffix) = base.split_at(host_start + i);
            format!("{}-{}{}", prefix, hash, suffix)
        }
        None => format!("{}-{}", base, hash),
    }
}

/// Strip the scheme from a URL, leaving the host.
pub fn host_of(url: &str) -> &str {
    let rest = url.find("://").map(|i| &url[i + 3..]).unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}
