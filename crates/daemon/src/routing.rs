//! Wires leased ports into the platform: a port on the shared tunnel service
//! (or a dedicated basic-auth service), and TCP or HTTP ingress rules.
//!
//! The reconciler does not track lease identity. Rules are found by the
//! backend port they forward to. Every change to a shared object is a pure
//! edit of the current list followed by a conditional write, retried when
//! another writer raced us.

use common::{BasicAuth, HeaderOverride};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RoutingConfig;
use crate::dns::AliasManager;
use crate::error::BrokerError;
use crate::platform::{
    AuthSecret, Backend, DedicatedService, HttpBackend, HttpIngress, HttpPath, IngressRule,
    Platform, PlatformError, ServicePort, TcpIngress,
};

const PORT_NAME_PREFIX: &str = "ssh-port-";
const CONFLICT_BACKOFF: Duration = Duration::from_millis(50);

/// How a lease's port should be exposed.
#[derive(Debug, Clone, Default)]
pub struct RouteSpec {
    pub http: Option<HttpRoute>,
    /// Write an ingress rule. Without it only the service port exists.
    pub expose_ingress: bool,
    /// The port was just claimed, so nothing of a live lease is on it yet and
    /// a failed call may delete every object it touched.
    pub fresh: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HttpRoute {
    /// Proxy endpoint path, without the leading slash.
    pub path: String,
    pub rewrite_rules_disabled: bool,
    pub header_overrides: Vec<HeaderOverride>,
    pub alias_host: Option<String>,
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Clone)]
pub struct RoutingReconciler {
    platform: Arc<dyn Platform>,
    aliases: Arc<dyn AliasManager>,
    config: RoutingConfig,
}

pub fn port_name(port: u16) -> String {
    format!("{PORT_NAME_PREFIX}{port}")
}

fn port_from_name(name: &str) -> Option<u16> {
    name.strip_prefix(PORT_NAME_PREFIX)?.parse().ok()
}

/// Rewrite stripping the proxy path prefix before the request reaches the node.
pub fn rewrite_rule(path: &str) -> String {
    format!(r"^([^\ ]*\ /){path}[/]?(.*)     \1\2")
}

/// `"<name> <value>"` entries in caller order, skipping blank names or values.
pub fn header_rules(overrides: &[HeaderOverride]) -> Vec<String> {
    overrides
        .iter()
        .filter_map(|h| {
            let (name, value) = (h.name.trim(), h.value.trim());
            (!name.is_empty() && !value.is_empty()).then(|| format!("{name} {value}"))
        })
        .collect()
}

fn with_service_port(current: &[ServicePort], port: u16) -> Option<Vec<ServicePort>> {
    let name = port_name(port);
    if current.iter().any(|p| p.name == name) {
        return None;
    }
    let mut next = current.to_vec();
    next.push(ServicePort::tcp(name, port));
    Some(next)
}

fn without_service_ports(current: &[ServicePort], ports: &BTreeSet<u16>) -> Option<Vec<ServicePort>> {
    let next: Vec<ServicePort> = current
        .iter()
        .filter(|p| !port_from_name(&p.name).is_some_and(|n| ports.contains(&n)))
        .cloned()
        .collect();
    (next.len() != current.len()).then_some(next)
}

fn with_rules(current: &[IngressRule], port: u16, rules: &[IngressRule]) -> Option<Vec<IngressRule>> {
    if current.iter().any(|r| r.references_port(port)) {
        return None;
    }
    let mut next = current.to_vec();
    next.extend_from_slice(rules);
    Some(next)
}

/// Drop every rule referencing one of `ports`. Also returns the hosts of
/// dropped HTTP rules that are not the default host, whose aliases should go.
fn without_port_rules(
    current: &[IngressRule],
    ports: &BTreeSet<u16>,
    default_host: &str,
) -> Option<(Vec<IngressRule>, Vec<String>)> {
    let mut kept = Vec::with_capacity(current.len());
    let mut alias_hosts = Vec::new();
    for rule in current {
        if ports.iter().any(|&p| rule.references_port(p)) {
            if rule.http.is_some() && !rule.host.is_empty() && rule.host != default_host {
                alias_hosts.push(rule.host.clone());
            }
        } else {
            kept.push(rule.clone());
        }
    }
    (kept.len() != current.len()).then_some((kept, alias_hosts))
}

impl RoutingReconciler {
    pub fn new(platform: Arc<dyn Platform>, aliases: Arc<dyn AliasManager>, config: RoutingConfig) -> Self {
        Self {
            platform,
            aliases,
            config,
        }
    }

    pub fn dedicated_service_name(&self, port: u16) -> String {
        format!("{}-{}", self.config.shared_service, port)
    }

    pub fn secret_name(&self, port: u16) -> String {
        format!("{}-{}", self.config.secret_prefix, port)
    }

    /// Idempotent: a port that already has its service port and rule is left
    /// untouched. Anything this call created is removed again if a later
    /// step fails. Basic-auth objects are recreated on every call, so they are
    /// only removed on failure for a fresh port; on a refresh the live rule
    /// still points at them.
    pub async fn add_route(&self, port: u16, spec: &RouteSpec) -> Result<(), BrokerError> {
        let basic_auth = spec.http.as_ref().and_then(|h| h.basic_auth.as_ref());

        let added_service_port = match basic_auth {
            Some(auth) => {
                self.provision_basic_auth(port, auth).await?;
                false
            }
            None => self.update_service(|current| with_service_port(current, port).map(|next| (next, ()))).await?.is_some(),
        };

        if !spec.expose_ingress {
            return Ok(());
        }

        if let Err(e) = self.add_ingress_rules(port, spec).await {
            tracing::warn!(port, error = %e, "Failed to add ingress rule, undoing service changes");
            if basic_auth.is_some() && spec.fresh {
                self.delete_basic_auth(port).await;
            } else if added_service_port {
                let ports = BTreeSet::from([port]);
                if let Err(undo) = self.update_service(|current| without_service_ports(current, &ports).map(|next| (next, ()))).await {
                    tracing::warn!(port, error = %undo, "Failed to remove service port after ingress failure");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove the rules, service port and basic-auth objects of one port.
    pub async fn remove_route(&self, port: u16) -> Result<(), BrokerError> {
        tracing::debug!(port, "Removing route");
        self.remove_ports(&BTreeSet::from([port])).await
    }

    /// Bulk removal with a single read-modify-write per shared object.
    pub async fn remove_routes(&self, ports: &[u16]) -> Result<(), BrokerError> {
        if ports.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = ports.len(), "Removing routes");
        self.remove_ports(&ports.iter().copied().collect()).await
    }

    async fn remove_ports(&self, ports: &BTreeSet<u16>) -> Result<(), BrokerError> {
        let host = self.config.ingress_host.clone();

        // try every object regardless of earlier failures, report the first
        let ingress = self
            .update_ingress(|current| without_port_rules(current, ports, &host))
            .await;
        if let Ok(Some(alias_hosts)) = &ingress {
            for alias in alias_hosts {
                if let Err(e) = self.aliases.retract(alias, &host).await {
                    tracing::warn!(host = %alias, error = %e, "Failed to retract DNS alias");
                }
            }
        }

        let service = self
            .update_service(|current| without_service_ports(current, ports).map(|next| (next, ())))
            .await;

        for &port in ports {
            self.delete_basic_auth(port).await;
        }

        ingress?;
        service?;
        Ok(())
    }

    fn lease_rules(&self, port: u16, spec: &RouteSpec) -> Vec<IngressRule> {
        let host = self.config.ingress_host.clone();
        let Some(http) = &spec.http else {
            return vec![IngressRule {
                host,
                http: None,
                tcp: Some(TcpIngress {
                    port: port.into(),
                    backend: Backend {
                        service_name: self.config.shared_service.clone(),
                        service_port: port.into(),
                    },
                }),
            }];
        };

        let service_name = if http.basic_auth.is_some() {
            self.dedicated_service_name(port)
        } else {
            self.config.shared_service.clone()
        };
        let headers = header_rules(&http.header_overrides);
        let rewrites = if http.rewrite_rules_disabled {
            Vec::new()
        } else {
            vec![rewrite_rule(&http.path)]
        };

        let http_rule = |host: String, path: String, rewrite_rules: Vec<String>| IngressRule {
            host,
            tcp: None,
            http: Some(HttpIngress {
                port: Some(self.config.http_port.into()),
                paths: vec![HttpPath {
                    path,
                    backend: HttpBackend {
                        service_name: service_name.clone(),
                        service_port: port.into(),
                        rewrite_rules,
                        header_rules: headers.clone(),
                    },
                }],
            }),
        };

        let mut rules = vec![http_rule(host, format!("/{}", http.path), rewrites)];
        if let Some(alias) = &http.alias_host {
            rules.push(http_rule(alias.clone(), "/".to_string(), Vec::new()));
        }
        rules
    }

    async fn add_ingress_rules(&self, port: u16, spec: &RouteSpec) -> Result<(), BrokerError> {
        let rules = self.lease_rules(port, spec);
        let added = self
            .update_ingress(|current| with_rules(current, port, &rules).map(|next| (next, ())))
            .await?
            .is_some();
        if !added {
            tracing::debug!(port, "Ingress rule already present");
            return Ok(());
        }
        tracing::info!(port, rules = rules.len(), "Added ingress rules");

        if let Some(alias) = spec.http.as_ref().and_then(|h| h.alias_host.as_ref()) {
            if let Err(e) = self.aliases.publish(alias, &self.config.ingress_host).await {
                tracing::warn!(host = %alias, error = %e, "Failed to publish DNS alias");
            }
        }
        Ok(())
    }

    /// Recreate the secret and dedicated service for `port`, deleting stale
    /// objects of the same name first.
    async fn provision_basic_auth(&self, port: u16, auth: &BasicAuth) -> Result<(), BrokerError> {
        let secret = AuthSecret {
            name: self.secret_name(port),
            auth: format!("{}::{}\n", auth.username, auth.password),
        };
        self.ignore_missing(self.platform.delete_secret(&secret.name).await, &secret.name);
        tolerate_existing(self.platform.create_secret(&secret).await)?;

        let service = DedicatedService {
            name: self.dedicated_service_name(port),
            ports: vec![ServicePort::tcp(port_name(port), port)],
            selector: self.config.backend_selector.clone(),
            annotations: BTreeMap::from([
                ("ingress.appscode.com/auth-type".to_string(), "basic".to_string()),
                ("ingress.appscode.com/auth-realm".to_string(), self.config.auth_realm.clone()),
                ("ingress.appscode.com/auth-secret".to_string(), secret.name.clone()),
            ]),
        };
        self.ignore_missing(self.platform.delete_service(&service.name).await, &service.name);
        if let Err(e) = tolerate_existing(self.platform.create_service(&service).await) {
            self.ignore_missing(self.platform.delete_secret(&secret.name).await, &secret.name);
            return Err(e.into());
        }
        tracing::info!(port, service = %service.name, "Provisioned basic auth service");
        Ok(())
    }

    async fn delete_basic_auth(&self, port: u16) {
        let service = self.dedicated_service_name(port);
        self.ignore_missing(self.platform.delete_service(&service).await, &service);
        let secret = self.secret_name(port);
        self.ignore_missing(self.platform.delete_secret(&secret).await, &secret);
    }

    fn ignore_missing(&self, result: Result<(), PlatformError>, name: &str) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(object = name, error = %e, "Failed to delete platform object"),
        }
    }

    async fn update_service<T, F>(&self, edit: F) -> Result<Option<T>, BrokerError>
    where
        F: Fn(&[ServicePort]) -> Option<(Vec<ServicePort>, T)>,
    {
        let mut attempt = 0;
        loop {
            let current = self.platform.service_ports().await?;
            let Some((next, out)) = edit(&current.value) else {
                return Ok(None);
            };
            match self.platform.replace_service_ports(&current.version, next).await {
                Ok(()) => return Ok(Some(out)),
                Err(PlatformError::Conflict(what)) if attempt < self.config.conflict_retries => {
                    attempt += 1;
                    tracing::debug!(object = %what, attempt, "Write conflict, retrying");
                    tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn update_ingress<T, F>(&self, edit: F) -> Result<Option<T>, BrokerError>
    where
        F: Fn(&[IngressRule]) -> Option<(Vec<IngressRule>, T)>,
    {
        let mut attempt = 0;
        loop {
            let current = self.platform.ingress_rules().await?;
            let Some((next, out)) = edit(&current.value) else {
                return Ok(None);
            };
            match self.platform.replace_ingress_rules(&current.version, next).await {
                Ok(()) => return Ok(Some(out)),
                Err(PlatformError::Conflict(what)) if attempt < self.config.conflict_retries => {
                    attempt += 1;
                    tracing::debug!(object = %what, attempt, "Write conflict, retrying");
                    tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn tolerate_existing(result: Result<(), PlatformError>) -> Result<(), PlatformError> {
    match result {
        Err(PlatformError::AlreadyExists(_)) => Ok(()),
        other => other,
    }
}
