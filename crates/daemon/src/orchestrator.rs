//! Setup and teardown of tunnel leases: allocation, routing, notification.

use chrono::Utc;
use common::{
    derived_dns_url, host_of, proxy_url, BasicAuth, CallerContext, Capability, LeaseKey, LeaseResult,
    LeaseView, SetupRequest, TeardownNotice, TeardownRequest,
};
use std::sync::Arc;
use std::time::Duration;

use crate::allocator::PortAllocator;
use crate::config::BrokerConfig;
use crate::db::{LeaseStore, Release};
use crate::dns::AliasManager;
use crate::error::BrokerError;
use crate::gc::GarbageCollector;
use crate::keys::{self, SERVICE_PROXY_USER};
use crate::notify::{Notifier, NotifyError, NotifyPolicy};
use crate::platform::Platform;
use crate::routing::{HttpRoute, RouteSpec, RoutingReconciler};

/// Undo actions recorded as setup steps succeed.
#[derive(Debug)]
enum Compensation {
    ReleasePort { key: LeaseKey, port: u16 },
}

#[derive(Debug, Default)]
struct Compensations(Vec<Compensation>);

impl Compensations {
    fn record(&mut self, step: Compensation) {
        self.0.push(step);
    }

    /// Run in reverse order of recording. Failures are logged; the garbage
    /// collector retries whatever is left behind.
    async fn unwind(self, allocator: &PortAllocator, routing: &RoutingReconciler) {
        for step in self.0.into_iter().rev() {
            match step {
                Compensation::ReleasePort { key, port } => {
                    tracing::info!(port, lease = %key, "Rolling back port allocation");
                    let tombstone = match allocator.release(&key, None, Utc::now()).await {
                        Ok(Release::Reclaiming(tombstone)) => tombstone,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!(port, error = %e, "Failed to release port during rollback");
                            continue;
                        }
                    };
                    // A port whose route removal fails stays tombstoned, and
                    // unavailable, until a sweep after the reclaim grace
                    // window collects it.
                    if let Err(e) = routing.remove_route(port).await {
                        tracing::warn!(port, error = %e, "Leftover route on rolled back port");
                        continue;
                    }
                    if let Err(e) = allocator.forget(&tombstone).await {
                        tracing::warn!(port, error = %e, "Failed to free port during rollback");
                    }
                }
            }
        }
    }
}

pub struct Broker {
    config: BrokerConfig,
    allocator: PortAllocator,
    routing: RoutingReconciler,
    gc: Arc<GarbageCollector>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        store: Arc<LeaseStore>,
        platform: Arc<dyn Platform>,
        aliases: Arc<dyn AliasManager>,
    ) -> Self {
        let allocator = PortAllocator::new(store, config.min_port, config.max_port);
        let routing = RoutingReconciler::new(platform, aliases, config.routing.clone());
        let gc = Arc::new(GarbageCollector::new(
            allocator.clone(),
            routing.clone(),
            config.reclaim_grace,
        ));
        Self {
            config,
            allocator,
            routing,
            gc,
        }
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    /// Checks that apply to every operation on a tenant's tunnels.
    fn check_access(&self, ctx: &CallerContext) -> Result<(), BrokerError> {
        if ctx.capability == Capability::Denied {
            return Err(BrokerError::PermissionDenied(format!(
                "tenant {} may not manage tunnels",
                ctx.tenant_id
            )));
        }
        if self.config.require_online_node && ctx.node_connected != Some(true) {
            return Err(BrokerError::PreconditionFailed("node is not connected".to_string()));
        }
        Ok(())
    }

    /// The feature toggle gates new and refreshed tunnels only. Tearing down a
    /// tunnel that outlived the toggle must keep working.
    fn check_enabled(&self, ctx: &CallerContext) -> Result<(), BrokerError> {
        if !ctx.service_proxy && !ctx.tunneling_enabled {
            return Err(BrokerError::PreconditionFailed(
                "remote tunneling is disabled for this node".to_string(),
            ));
        }
        Ok(())
    }

    fn lease_duration(&self, req: &SetupRequest) -> Result<Duration, BrokerError> {
        let duration = req
            .duration_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_lease_duration);
        if duration < self.config.min_lease_duration {
            return Err(BrokerError::InvalidRequest(format!(
                "lease duration {}s is below the minimum of {}s",
                duration.as_secs(),
                self.config.min_lease_duration.as_secs()
            )));
        }
        Ok(duration)
    }

    fn validate_request(&self, req: &SetupRequest) -> Result<(), BrokerError> {
        if req.node_id.trim().is_empty() {
            return Err(BrokerError::InvalidRequest("node id is required".to_string()));
        }
        if req.endpoint.is_empty() {
            if req.basic_auth.is_some() || req.generate_basic_auth {
                return Err(BrokerError::InvalidRequest(
                    "basic auth requires an HTTP endpoint".to_string(),
                ));
            }
            if req.dns_alias.is_some() || req.derive_dns_alias {
                return Err(BrokerError::InvalidRequest(
                    "DNS alias requires an HTTP endpoint".to_string(),
                ));
            }
            if req.tls_endpoint {
                return Err(BrokerError::InvalidRequest(
                    "TLS endpoint requires an HTTP endpoint".to_string(),
                ));
            }
        }
        if let Some(auth) = &req.basic_auth {
            if auth.username.is_empty() || auth.password.is_empty() || auth.username.contains(':') {
                return Err(BrokerError::InvalidRequest("malformed basic auth credentials".to_string()));
            }
        }
        Ok(())
    }

    /// Allocate (or refresh) a lease, wire its route and notify the peer.
    /// On a routing failure a freshly allocated port is released again before
    /// the error is returned.
    pub async fn setup(
        &self,
        ctx: &CallerContext,
        req: SetupRequest,
        notifier: &dyn Notifier,
    ) -> Result<LeaseResult, BrokerError> {
        self.check_access(ctx)?;
        self.check_enabled(ctx)?;
        self.validate_request(&req)?;
        let duration = self.lease_duration(&req)?;
        let key = req.key(&ctx.tenant_id);

        let (public_key, private_key) = match req.public_key.as_deref().map(str::trim) {
            Some(existing) if !existing.is_empty() => (existing.to_string(), None),
            _ => {
                let pair = keys::generate_keypair()?;
                (pair.public_key, Some(pair.private_key))
            }
        };

        let basic_auth = match req.basic_auth.clone() {
            Some(auth) => Some(auth),
            None if req.generate_basic_auth => Some(BasicAuth {
                username: SERVICE_PROXY_USER.to_string(),
                password: keys::generate_password(),
            }),
            None => None,
        };

        let (url, dns_url) = self.public_urls(&key, &req);

        let allocation = self
            .allocator
            .allocate(&key, &public_key, duration, Utc::now())
            .await?;
        let mut compensations = Compensations::default();
        if allocation.fresh {
            compensations.record(Compensation::ReleasePort {
                key: key.clone(),
                port: allocation.port,
            });
        }

        let spec = RouteSpec {
            expose_ingress: key.is_http() || ctx.service_proxy || ctx.cli_ssh_allowed,
            http: key.is_http().then(|| HttpRoute {
                path: key.proxy_endpoint_path(),
                rewrite_rules_disabled: req.rewrite_rules_disabled,
                header_overrides: req.header_overrides.clone(),
                alias_host: dns_url.as_deref().map(|u| host_of(u).to_string()),
                basic_auth: basic_auth.clone(),
            }),
            fresh: allocation.fresh,
        };
        if let Err(e) = self.routing.add_route(allocation.port, &spec).await {
            tracing::warn!(port = allocation.port, lease = %key, error = %e, "Route setup failed");
            compensations.unwind(&self.allocator, &self.routing).await;
            return Err(e);
        }

        let result = LeaseResult {
            tenant_id: key.tenant_id.clone(),
            node_id: key.node_id.clone(),
            endpoint: key.endpoint.clone(),
            port: allocation.port,
            public_key,
            private_key,
            expires_at: allocation.expires_at,
            host: self.config.ingress_host().to_string(),
            url,
            dns_url,
            basic_auth,
            tls_endpoint: req.tls_endpoint,
            skip_cert_verification: req.tls_endpoint && req.skip_cert_verification,
        };

        if let Err(e) = notifier.tunnel_ready(&result).await {
            self.on_notify_failure(&key, e)?;
        }

        tracing::info!(
            port = result.port,
            tenant_id = %key.tenant_id,
            node_id = %key.node_id,
            fresh = allocation.fresh,
            "Tunnel ready"
        );
        self.gc.trigger();
        Ok(result)
    }

    /// End the request's session on the lease, or every session when no
    /// public key is given. The route is removed once no session is left.
    /// Calling this for a key with no lease is not an error.
    pub async fn teardown(
        &self,
        ctx: &CallerContext,
        req: TeardownRequest,
        notifier: &dyn Notifier,
    ) -> Result<(), BrokerError> {
        self.check_access(ctx)?;
        let key = req.key(&ctx.tenant_id);
        let public_key = req.public_key.as_deref().map(str::trim).filter(|k| !k.is_empty());

        let port = match self.allocator.release(&key, public_key, Utc::now()).await? {
            Release::Reclaiming(tombstone) => {
                match self.routing.remove_route(tombstone.port).await {
                    Ok(()) => {
                        if let Err(e) = self.allocator.forget(&tombstone).await {
                            tracing::warn!(port = tombstone.port, error = %e, "Failed to free port, leaving it to the sweep");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(port = tombstone.port, lease = %key, error = %e, "Route removal failed, leaving it to the sweep");
                    }
                }
                Some(tombstone.port)
            }
            Release::Shared(port) => Some(port),
            Release::Missing => None,
        };

        let notice = TeardownNotice {
            tenant_id: key.tenant_id.clone(),
            node_id: key.node_id.clone(),
            endpoint: key.endpoint.clone(),
            public_key: req.public_key,
            port,
        };
        if let Err(e) = notifier.tunnel_closed(&notice).await {
            self.on_notify_failure(&key, e)?;
        }
        tracing::info!(lease = %key, port = ?port, "Tunnel torn down");
        Ok(())
    }

    pub async fn leases(&self) -> Result<Vec<LeaseView>, BrokerError> {
        Ok(self
            .allocator
            .leases()
            .await?
            .into_iter()
            .map(|r| LeaseView {
                port: r.port,
                key: r.key,
                state: r.state.as_str().to_string(),
                allocated_at: r.allocated_at,
                expires_at: r.expires_at,
            })
            .collect())
    }

    fn public_urls(&self, key: &LeaseKey, req: &SetupRequest) -> (Option<String>, Option<String>) {
        if !key.is_http() {
            return (None, None);
        }
        let base = &self.config.proxy_url_base;
        let path = key.proxy_endpoint_path();
        let dns_url = match req.dns_alias.as_deref().map(str::trim) {
            Some(alias) if !alias.is_empty() => {
                let scheme = base.split_once("://").map(|(s, _)| s).unwrap_or("https");
                Some(format!("{scheme}://{}", host_of(alias)))
            }
            _ if req.derive_dns_alias => Some(derived_dns_url(base, &path)),
            _ => None,
        };
        (Some(proxy_url(base, &path)), dns_url)
    }

    fn on_notify_failure(&self, key: &LeaseKey, e: NotifyError) -> Result<(), BrokerError> {
        match self.config.notify_policy {
            NotifyPolicy::Strict => {
                tracing::warn!(lease = %key, error = %e, "Peer notification failed");
                Err(e.into())
            }
            NotifyPolicy::Permissive => {
                tracing::warn!(lease = %key, error = %e, "Peer notification failed, ignoring");
                Ok(())
            }
        }
    }
}
