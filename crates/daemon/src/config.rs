use clap::{Parser, ValueEnum};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::notify::NotifyPolicy;

pub const DEFAULT_MIN_PORT: u16 = 20000;
pub const DEFAULT_MAX_PORT: u16 = 32767;
pub const DEFAULT_LEASE_SECS: u64 = 30 * 60;
pub const MIN_LEASE_SECS: u64 = 5 * 60;
pub const DEFAULT_RECLAIM_GRACE_SECS: u64 = 2 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid port range {min}-{max}")]
    PortRange { min: u16, max: u16 },

    #[error("proxy url base must include a scheme: {0}")]
    ProxyUrl(String),

    #[error("default lease duration {default:?} is below the minimum {min:?}")]
    Duration { default: Duration, min: Duration },

    #[error("invalid selector entry {0:?}, expected key=value")]
    Selector(String),

    #[error("reclaim grace must be positive")]
    ReclaimGrace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlatformKind {
    Memory,
    Kubernetes,
}

/// Names and shape of the platform objects the reconciler writes.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub ingress_host: String,
    pub shared_service: String,
    pub secret_prefix: String,
    pub backend_selector: BTreeMap<String, String>,
    pub auth_realm: String,
    pub http_port: u16,
    pub conflict_retries: u32,
}

impl RoutingConfig {
    pub fn new(ingress_host: impl Into<String>) -> Self {
        Self {
            ingress_host: ingress_host.into(),
            shared_service: "wstun-svc".to_string(),
            secret_prefix: "wstun-secret".to_string(),
            backend_selector: BTreeMap::from([("app".to_string(), "wstun-server".to_string())]),
            auth_realm: "HttpServiceProxy".to_string(),
            http_port: 80,
            conflict_retries: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub min_port: u16,
    pub max_port: u16,
    /// e.g. `https://wst-prod.example.com`
    pub proxy_url_base: String,
    pub default_lease_duration: Duration,
    pub min_lease_duration: Duration,
    pub sweep_interval: Duration,
    /// Age at which the sweep treats a tombstone as abandoned by the
    /// teardown or rollback that made it.
    pub reclaim_grace: Duration,
    pub notify_policy: NotifyPolicy,
    pub require_online_node: bool,
    pub routing: RoutingConfig,
}

impl BrokerConfig {
    pub fn new(proxy_url_base: impl Into<String>) -> Self {
        let proxy_url_base = proxy_url_base.into().trim_end_matches('/').to_string();
        let routing = RoutingConfig::new(common::host_of(&proxy_url_base));
        Self {
            min_port: DEFAULT_MIN_PORT,
            max_port: DEFAULT_MAX_PORT,
            proxy_url_base,
            default_lease_duration: Duration::from_secs(DEFAULT_LEASE_SECS),
            min_lease_duration: Duration::from_secs(MIN_LEASE_SECS),
            sweep_interval: Duration::from_secs(60),
            reclaim_grace: Duration::from_secs(DEFAULT_RECLAIM_GRACE_SECS),
            notify_policy: NotifyPolicy::Strict,
            require_online_node: false,
            routing,
        }
    }

    pub fn ingress_host(&self) -> &str {
        &self.routing.ingress_host
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_port == 0 || self.min_port > self.max_port {
            return Err(ConfigError::PortRange {
                min: self.min_port,
                max: self.max_port,
            });
        }
        if !self.proxy_url_base.contains("://") || self.routing.ingress_host.is_empty() {
            return Err(ConfigError::ProxyUrl(self.proxy_url_base.clone()));
        }
        if self.reclaim_grace.is_zero() {
            return Err(ConfigError::ReclaimGrace);
        }
        if self.default_lease_duration < self.min_lease_duration {
            return Err(ConfigError::Duration {
                default: self.default_lease_duration,
                min: self.min_lease_duration,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Reverse tunnel port broker", long_about = None)]
pub struct Args {
    /// Address the HTTP surface listens on
    #[arg(long, env = "BROKER_LISTEN", default_value = "127.0.0.1:3030")]
    pub listen: SocketAddr,

    /// SQLite coordination store shared by all replicas
    #[arg(long, env = "BROKER_DB_PATH")]
    pub db_path: Option<PathBuf>,

    #[arg(long, env = "BROKER_MIN_PORT", default_value_t = DEFAULT_MIN_PORT)]
    pub min_port: u16,

    #[arg(long, env = "BROKER_MAX_PORT", default_value_t = DEFAULT_MAX_PORT)]
    pub max_port: u16,

    /// Public base URL of the ingress, e.g. https://wst-prod.example.com
    #[arg(long, env = "BROKER_PROXY_URL_BASE")]
    pub proxy_url_base: String,

    #[arg(long, env = "BROKER_DEFAULT_LEASE_SECS", default_value_t = DEFAULT_LEASE_SECS)]
    pub default_lease_secs: u64,

    #[arg(long, env = "BROKER_MIN_LEASE_SECS", default_value_t = MIN_LEASE_SECS)]
    pub min_lease_secs: u64,

    /// Interval of the background garbage collection sweep
    #[arg(long, env = "BROKER_SWEEP_SECS", default_value_t = 60)]
    pub sweep_secs: u64,

    /// Seconds a released port stays with the call that released it before
    /// the sweep may collect it; keep it above the slowest platform call
    #[arg(long, env = "BROKER_RECLAIM_GRACE_SECS", default_value_t = DEFAULT_RECLAIM_GRACE_SECS)]
    pub reclaim_grace_secs: u64,

    #[arg(long, env = "BROKER_NOTIFY_POLICY", value_enum, default_value_t = NotifyPolicy::Strict)]
    pub notify_policy: NotifyPolicy,

    /// Base URL of the edge message relay; notifications are skipped when unset
    #[arg(long, env = "BROKER_NOTIFY_URL")]
    pub notify_url: Option<String>,

    #[arg(long, env = "BROKER_NOTIFY_TIMEOUT_SECS", default_value_t = 30)]
    pub notify_timeout_secs: u64,

    /// Base URL of the DNS provider API managing alias records; aliases are
    /// only logged when unset
    #[arg(long, env = "BROKER_DNS_URL")]
    pub dns_url: Option<String>,

    /// Bearer token for the DNS provider API
    #[arg(long, env = "BROKER_DNS_TOKEN", hide_env_values = true)]
    pub dns_token: Option<String>,

    #[arg(long, env = "BROKER_DNS_TIMEOUT_SECS", default_value_t = 10)]
    pub dns_timeout_secs: u64,

    /// Refuse to set up tunnels to nodes not reported as connected
    #[arg(long, env = "BROKER_REQUIRE_ONLINE_NODE")]
    pub require_online_node: bool,

    #[arg(long, env = "BROKER_PLATFORM", value_enum, default_value_t = PlatformKind::Memory)]
    pub platform: PlatformKind,

    /// Namespace of the tunnel objects; defaults to the pod's namespace
    #[arg(long, env = "BROKER_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "BROKER_SHARED_SERVICE", default_value = "wstun-svc")]
    pub shared_service: String,

    #[arg(long, env = "BROKER_INGRESS", default_value = "cloudmgmt-wstun-ingress")]
    pub ingress: String,

    #[arg(long, env = "BROKER_SECRET_PREFIX", default_value = "wstun-secret")]
    pub secret_prefix: String,

    /// Pod selector of the tunnel server, as key=value[,key=value]
    #[arg(long, env = "BROKER_BACKEND_SELECTOR", default_value = "app=wstun-server")]
    pub backend_selector: String,

    #[arg(long, env = "BROKER_CONFLICT_RETRIES", default_value_t = 5)]
    pub conflict_retries: u32,
}

impl Args {
    pub fn broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        let mut config = BrokerConfig::new(&self.proxy_url_base);
        config.min_port = self.min_port;
        config.max_port = self.max_port;
        config.default_lease_duration = Duration::from_secs(self.default_lease_secs);
        config.min_lease_duration = Duration::from_secs(self.min_lease_secs);
        config.sweep_interval = Duration::from_secs(self.sweep_secs.max(1));
        config.reclaim_grace = Duration::from_secs(self.reclaim_grace_secs);
        config.notify_policy = self.notify_policy;
        config.require_online_node = self.require_online_node;
        config.routing.shared_service = self.shared_service.clone();
        config.routing.secret_prefix = self.secret_prefix.clone();
        config.routing.backend_selector = parse_selector(&self.backend_selector)?;
        config.routing.conflict_retries = self.conflict_retries;
        config.validate()?;
        Ok(config)
    }
}

fn parse_selector(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
            _ => Err(ConfigError::Selector(entry.to_string())),
        })
        .collect()
}
