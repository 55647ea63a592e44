//! The slice of orchestration-platform state the broker manages: the port
//! list of the shared tunnel service, the ingress rule list, and per-port
//! basic-auth secrets and services.
//!
//! Shared objects are read together with a version and written back with a
//! conditional replace, which fails with [`PlatformError::Conflict`] when
//! another writer got there first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

mod kube;
mod memory;

pub use kube::KubePlatform;
pub use memory::MemoryPlatform;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed object: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

/// A port given either as a number or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRef {
    Number(u16),
    Name(String),
}

impl PortRef {
    pub fn number(&self) -> Option<u16> {
        match self {
            PortRef::Number(n) => Some(*n),
            PortRef::Name(s) => s.parse().ok(),
        }
    }
}

impl From<u16> for PortRef {
    fn from(port: u16) -> Self {
        PortRef::Number(port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    #[serde(default = "tcp")]
    pub protocol: String,
    pub port: u16,
    pub target_port: PortRef,
}

fn tcp() -> String {
    "TCP".to_string()
}

impl ServicePort {
    pub fn tcp(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            protocol: tcp(),
            port,
            target_port: port.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub service_name: String,
    pub service_port: PortRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpBackend {
    pub service_name: String,
    pub service_port: PortRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rewrite_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpPath {
    #[serde(default)]
    pub path: String,
    pub backend: HttpBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpIngress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortRef>,
    #[serde(default)]
    pub paths: Vec<HttpPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpIngress {
    pub port: PortRef,
    pub backend: Backend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpIngress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpIngress>,
}

impl IngressRule {
    /// Whether this rule forwards traffic for `port`: a TCP rule listening
    /// on it, or an HTTP rule with a path backed by it.
    pub fn references_port(&self, port: u16) -> bool {
        if let Some(tcp) = &self.tcp {
            return tcp.port.number() == Some(port);
        }
        match &self.http {
            Some(http) => http
                .paths
                .iter()
                .any(|p| p.backend.service_port.number() == Some(port)),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: String,
    pub value: T,
}

/// Basic-auth credential secret; `auth` holds the raw `user::password\n` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSecret {
    pub name: String,
    pub auth: String,
}

/// A per-port service fronting a basic-auth protected lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedicatedService {
    pub name: String,
    pub ports: Vec<ServicePort>,
    pub selector: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn service_ports(&self) -> Result<Versioned<Vec<ServicePort>>, PlatformError>;

    async fn replace_service_ports(
        &self,
        version: &str,
        ports: Vec<ServicePort>,
    ) -> Result<(), PlatformError>;

    async fn ingress_rules(&self) -> Result<Versioned<Vec<IngressRule>>, PlatformError>;

    async fn replace_ingress_rules(
        &self,
        version: &str,
        rules: Vec<IngressRule>,
    ) -> Result<(), PlatformError>;

    async fn create_secret(&self, secret: &AuthSecret) -> Result<(), PlatformError>;

    async fn delete_secret(&self, name: &str) -> Result<(), PlatformError>;

    async fn create_service(&self, service: &DedicatedService) -> Result<(), PlatformError>;

    async fn delete_service(&self, name: &str) -> Result<(), PlatformError>;
}
