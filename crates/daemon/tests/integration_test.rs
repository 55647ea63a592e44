use async_trait::async_trait;
use broker_daemon::{
    allocator::PortAllocator,
    config::{BrokerConfig, RoutingConfig},
    db::{LeaseStore, Release},
    dns::MemoryAliases,
    error::ErrorKind,
    notify::{NoopNotifier, Notifier, NotifyError, NotifyPolicy},
    platform::MemoryPlatform,
    routing::RoutingReconciler,
    Broker, BrokerError,
};
use chrono::Utc;
use common::{
    BasicAuth, CallerContext, LeaseKey, LeaseResult, SetupRequest, TeardownNotice, TeardownRequest,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BASE: &str = "https://wst-test.example.com";
const HOST: &str = "wst-test.example.com";

struct Harness {
    broker: Arc<Broker>,
    store: Arc<LeaseStore>,
    platform: Arc<MemoryPlatform>,
    aliases: Arc<MemoryAliases>,
}

fn config(min: u16, max: u16) -> BrokerConfig {
    let mut config = BrokerConfig::new(BASE);
    config.min_port = min;
    config.max_port = max;
    config.min_lease_duration = Duration::from_secs(1);
    config
}

fn harness_with(config: BrokerConfig) -> Harness {
    let store = Arc::new(LeaseStore::open_in_memory().unwrap());
    let platform = Arc::new(MemoryPlatform::new());
    let aliases = Arc::new(MemoryAliases::new());
    let broker = Arc::new(Broker::new(config, store.clone(), platform.clone(), aliases.clone()));
    Harness {
        broker,
        store,
        platform,
        aliases,
    }
}

fn harness(min: u16, max: u16) -> Harness {
    harness_with(config(min, max))
}

fn ctx() -> CallerContext {
    CallerContext::allowed("tenant-1")
}

fn teardown_of(node: &str) -> TeardownRequest {
    TeardownRequest {
        node_id: node.to_string(),
        ..Default::default()
    }
}

#[derive(Default)]
struct RecordingNotifier {
    fail: AtomicBool,
    ready: Mutex<Vec<LeaseResult>>,
    closed: Mutex<Vec<TeardownNotice>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn tunnel_ready(&self, lease: &LeaseResult) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected("edge offline".to_string()));
        }
        self.ready.lock().unwrap().push(lease.clone());
        Ok(())
    }

    async fn tunnel_closed(&self, notice: &TeardownNotice) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected("edge offline".to_string()));
        }
        self.closed.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_setups_never_share_a_port() {
    let mut config = config(30000, 30009);
    config.routing.conflict_retries = 200;
    let h = harness_with(config);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let broker = h.broker.clone();
        tasks.push(tokio::spawn(async move {
            broker
                .setup(&ctx(), SetupRequest::tcp(format!("node-{i}")), &NoopNotifier)
                .await
        }));
    }

    let mut ports = BTreeSet::new();
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(lease) => assert!(ports.insert(lease.port), "port {} handed out twice", lease.port),
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::ResourceExhausted);
                exhausted += 1;
            }
        }
    }
    assert_eq!(ports, (30000..=30009).collect::<BTreeSet<u16>>());
    assert_eq!(exhausted, 6);
    for port in ports {
        assert_eq!(h.platform.rules_for_port(port), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicas_sharing_a_database_never_share_a_port() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leases.db");
    let platform = Arc::new(MemoryPlatform::new());

    let replicas: Vec<Arc<Broker>> = (0..2)
        .map(|_| {
            let mut config = config(30000, 30005);
            config.routing.conflict_retries = 200;
            Arc::new(Broker::new(
                config,
                Arc::new(LeaseStore::open(&path).unwrap()),
                platform.clone(),
                Arc::new(MemoryAliases::new()),
            ))
        })
        .collect();

    let mut tasks = Vec::new();
    for i in 0..6 {
        let broker = replicas[i % 2].clone();
        tasks.push(tokio::spawn(async move {
            broker
                .setup(&ctx(), SetupRequest::tcp(format!("node-{i}")), &NoopNotifier)
                .await
        }));
    }
    let mut ports = BTreeSet::new();
    for task in tasks {
        assert!(ports.insert(task.await.unwrap().unwrap().port));
    }
    assert_eq!(ports.len(), 6);

    let err = replicas[0]
        .setup(&ctx(), SetupRequest::tcp("node-late"), &NoopNotifier)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ResourceExhausted { .. }));
}

#[tokio::test]
async fn refresh_returns_same_port_and_single_rule() {
    let h = harness(30000, 30009);
    let first = h.broker.setup(&ctx(), SetupRequest::tcp("node-a"), &NoopNotifier).await.unwrap();

    let mut refresh = SetupRequest::tcp("node-a");
    refresh.public_key = Some(first.public_key.clone());
    refresh.duration_secs = Some(3600);
    let second = h.broker.setup(&ctx(), refresh, &NoopNotifier).await.unwrap();

    assert_eq!(first.port, second.port);
    assert!(second.expires_at > first.expires_at);
    assert_eq!(h.platform.rules_for_port(first.port), 1);
    assert_eq!(h.platform.current_service_ports().len(), 1);
    assert_eq!(h.broker.leases().await.unwrap().len(), 1);
}

#[tokio::test]
async fn routing_failure_frees_the_port() {
    let h = harness(30000, 30009);
    h.platform.fail_ingress_writes(true);

    let err = h
        .broker
        .setup(&ctx(), SetupRequest::tcp("node-a"), &NoopNotifier)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalSystem);
    assert!(h.broker.leases().await.unwrap().is_empty());
    assert!(h.platform.current_service_ports().is_empty());

    h.platform.fail_ingress_writes(false);
    let lease = h.broker.setup(&ctx(), SetupRequest::tcp("node-b"), &NoopNotifier).await.unwrap();
    assert_eq!(lease.port, 30000);
}

#[tokio::test]
async fn refresh_of_existing_route_needs_no_shared_writes() {
    let h = harness(30000, 30009);
    let auth = BasicAuth {
        username: "user".to_string(),
        password: "pass".to_string(),
    };
    let mut req = SetupRequest::http("node-a", "svc:80");
    req.basic_auth = Some(auth);
    let lease = h.broker.setup(&ctx(), req.clone(), &NoopNotifier).await.unwrap();

    h.platform.inject_conflicts(1000);
    req.public_key = Some(lease.public_key.clone());
    // the rule exists, so the refresh needs no shared writes and succeeds
    let again = h.broker.setup(&ctx(), req, &NoopNotifier).await.unwrap();
    assert_eq!(again.port, lease.port);
    assert_eq!(h.platform.rules_for_port(lease.port), 1);
    assert_eq!(h.broker.leases().await.unwrap().len(), 1);
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let h = harness(30000, 30009);
    h.broker.teardown(&ctx(), teardown_of("ghost"), &NoopNotifier).await.unwrap();

    let lease = h.broker.setup(&ctx(), SetupRequest::tcp("node-a"), &NoopNotifier).await.unwrap();
    h.broker.teardown(&ctx(), teardown_of("node-a"), &NoopNotifier).await.unwrap();
    h.broker.teardown(&ctx(), teardown_of("node-a"), &NoopNotifier).await.unwrap();

    assert_eq!(h.platform.rules_for_port(lease.port), 0);
    assert!(!h.platform.has_service_port(lease.port));
    assert!(h.broker.leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn teardown_survives_routing_failure_and_sweep_finishes_it() {
    let h = harness(30000, 30009);
    let lease = h.broker.setup(&ctx(), SetupRequest::tcp("node-a"), &NoopNotifier).await.unwrap();

    h.platform.fail_ingress_writes(true);
    h.broker.teardown(&ctx(), teardown_of("node-a"), &NoopNotifier).await.unwrap();
    h.platform.fail_ingress_writes(false);

    // the stale rule still references the port, so it must not be reused yet
    let other = h.broker.setup(&ctx(), SetupRequest::tcp("node-b"), &NoopNotifier).await.unwrap();
    assert_ne!(other.port, lease.port);

    // the tombstone is abandoned once the grace window has passed
    let past_grace = Utc::now() + chrono::Duration::seconds(121);
    h.broker.gc().sweep(past_grace).await.unwrap();
    assert_eq!(h.platform.rules_for_port(lease.port), 0);
    assert_eq!(h.platform.rules_for_port(other.port), 1);
    let leases = h.broker.leases().await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].port, other.port);
}

#[tokio::test]
async fn late_route_removal_cannot_hit_a_reused_port() {
    let h = harness(30000, 30009);
    let first = h.broker.setup(&ctx(), SetupRequest::tcp("node-a"), &NoopNotifier).await.unwrap();

    // a teardown that has released the lease but not yet removed its route
    let allocator = PortAllocator::new(h.store.clone(), 30000, 30009);
    let key = LeaseKey::new("tenant-1", "node-a", "");
    let Release::Reclaiming(tombstone) = allocator.release(&key, None, Utc::now()).await.unwrap() else {
        panic!("expected the lease to be released");
    };

    let report = h.broker.gc().sweep(Utc::now()).await.unwrap();
    assert!(report.reclaimed.is_empty());
    let second = h.broker.setup(&ctx(), SetupRequest::tcp("node-b"), &NoopNotifier).await.unwrap();
    assert_ne!(second.port, first.port);

    let routing = RoutingReconciler::new(h.platform.clone(), h.aliases.clone(), RoutingConfig::new(HOST));
    routing.remove_route(tombstone.port).await.unwrap();
    assert!(allocator.forget(&tombstone).await.unwrap());

    assert_eq!(h.platform.rules_for_port(second.port), 1);
    assert!(h.platform.has_service_port(second.port));
    let leases = h.broker.leases().await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].port, second.port);
}

#[tokio::test]
async fn successful_setup_sweeps_expired_leases() {
    let h = harness(30000, 30009);
    let mut req = SetupRequest::tcp("node-a");
    req.duration_secs = Some(1);
    let expired = h.broker.setup(&ctx(), req, &NoopNotifier).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let live = h.broker.setup(&ctx(), SetupRequest::tcp("node-b"), &NoopNotifier).await.unwrap();
    assert_ne!(live.port, expired.port);

    // the sweep runs in the background
    for _ in 0..200 {
        if h.platform.rules_for_port(expired.port) == 0 && h.broker.leases().await.unwrap().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.platform.rules_for_port(expired.port), 0);
    assert!(!h.platform.has_service_port(expired.port));
    let leases = h.broker.leases().await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].port, live.port);

    let next = h.broker.setup(&ctx(), SetupRequest::tcp("node-c"), &NoopNotifier).await.unwrap();
    assert_eq!(next.port, expired.port);
}

#[tokio::test]
async fn shared_lease_outlives_one_clients_teardown() {
    let h = harness(30000, 30009);
    let first = h.broker.setup(&ctx(), SetupRequest::tcp("node-a"), &NoopNotifier).await.unwrap();
    // a second client without a key gets its own session on the same lease
    let second = h.broker.setup(&ctx(), SetupRequest::tcp("node-a"), &NoopNotifier).await.unwrap();
    assert_eq!(second.port, first.port);
    assert_ne!(second.public_key, first.public_key);

    let notifier = RecordingNotifier::default();
    let mut teardown = teardown_of("node-a");
    teardown.public_key = Some(first.public_key.clone());
    h.broker.teardown(&ctx(), teardown, &notifier).await.unwrap();
    assert_eq!(h.platform.rules_for_port(first.port), 1);
    assert_eq!(h.broker.leases().await.unwrap()[0].state, "live");

    let mut teardown = teardown_of("node-a");
    teardown.public_key = Some(second.public_key.clone());
    h.broker.teardown(&ctx(), teardown, &notifier).await.unwrap();
    assert_eq!(h.platform.rules_for_port(first.port), 0);
    assert!(h.broker.leases().await.unwrap().is_empty());

    let closed = notifier.closed.lock().unwrap();
    assert_eq!(closed.len(), 2);
    assert_eq!(closed[0].public_key.as_deref(), Some(first.public_key.as_str()));
}

#[tokio::test]
async fn service_write_failure_frees_the_port() {
    let h = harness(30000, 30009);
    h.platform.fail_service_writes(true);
    let err = h
        .broker
        .setup(&ctx(), SetupRequest::tcp("node-a"), &NoopNotifier)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Platform(_)));
    assert!(h.broker.leases().await.unwrap().is_empty());
    assert!(h.platform.current_ingress_rules().is_empty());

    h.platform.fail_service_writes(false);
    let lease = h.broker.setup(&ctx(), SetupRequest::tcp("node-b"), &NoopNotifier).await.unwrap();
    assert_eq!(lease.port, 30000);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_by_one_sweep() {
    let h = harness(30000, 30009);
    let mut req = SetupRequest::tcp("node-a");
    req.duration_secs = Some(5);
    let lease = h.broker.setup(&ctx(), req, &NoopNotifier).await.unwrap();
    assert_eq!(h.platform.rules_for_port(lease.port), 1);

    let report = h
        .broker
        .gc()
        .sweep(Utc::now() + chrono::Duration::seconds(6))
        .await
        .unwrap();
    assert_eq!(report.reclaimed, vec![lease.port]);
    assert_eq!(h.platform.rules_for_port(lease.port), 0);
    assert!(!h.platform.has_service_port(lease.port));

    let next = h.broker.setup(&ctx(), SetupRequest::tcp("node-b"), &NoopNotifier).await.unwrap();
    assert_eq!(next.port, lease.port);
}

#[tokio::test]
async fn refresh_wins_against_a_sweep_that_listed_it() {
    let h = harness(30000, 30009);
    let mut req = SetupRequest::tcp("node-a");
    req.duration_secs = Some(5);
    let lease = h.broker.setup(&ctx(), req.clone(), &NoopNotifier).await.unwrap();

    let later = Utc::now() + chrono::Duration::seconds(6);
    let allocator = PortAllocator::new(h.store.clone(), 30000, 30009);
    let listed = allocator.list_expired(later, later).await.unwrap();
    assert_eq!(listed.len(), 1);

    req.public_key = Some(lease.public_key.clone());
    req.duration_secs = Some(600);
    h.broker.setup(&ctx(), req, &NoopNotifier).await.unwrap();

    assert!(allocator.mark_reclaiming(&listed[0], later, later).await.unwrap().is_none());
    let report = h.broker.gc().sweep(later).await.unwrap();
    assert!(report.reclaimed.is_empty());
    assert_eq!(h.platform.rules_for_port(lease.port), 1);
    assert_eq!(h.broker.leases().await.unwrap()[0].state, "live");
}

#[tokio::test]
async fn three_port_pool_scenario() {
    let h = harness(30000, 30002);
    let mut ports = Vec::new();
    for node in ["a", "b", "c"] {
        let lease = h.broker.setup(&ctx(), SetupRequest::tcp(node), &NoopNotifier).await.unwrap();
        assert!((30000..=30002).contains(&lease.port));
        ports.push(lease.port);
    }
    assert_eq!(ports.iter().collect::<BTreeSet<_>>().len(), 3);

    let err = h.broker.setup(&ctx(), SetupRequest::tcp("d"), &NoopNotifier).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    h.broker.teardown(&ctx(), teardown_of("b"), &NoopNotifier).await.unwrap();
    let d = h.broker.setup(&ctx(), SetupRequest::tcp("d"), &NoopNotifier).await.unwrap();
    assert_eq!(d.port, ports[1]);
}

#[tokio::test]
async fn strict_notification_failure_surfaces_but_keeps_lease() {
    let h = harness(30000, 30009);
    let notifier = RecordingNotifier::default();
    notifier.fail.store(true, Ordering::SeqCst);

    let err = h
        .broker
        .setup(&ctx(), SetupRequest::tcp("node-a"), &notifier)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Notify(_)));
    let leases = h.broker.leases().await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(h.platform.rules_for_port(leases[0].port), 1);

    let err = h
        .broker
        .teardown(&ctx(), teardown_of("node-a"), &notifier)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Notify(_)));
    assert!(h.broker.leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn permissive_notification_failure_is_ignored() {
    let mut config = config(30000, 30009);
    config.notify_policy = NotifyPolicy::Permissive;
    let h = harness_with(config);
    let notifier = RecordingNotifier::default();
    notifier.fail.store(true, Ordering::SeqCst);

    h.broker.setup(&ctx(), SetupRequest::tcp("node-a"), &notifier).await.unwrap();
    h.broker.teardown(&ctx(), teardown_of("node-a"), &notifier).await.unwrap();
}

#[tokio::test]
async fn peer_receives_lease_coordinates() {
    let h = harness(30000, 30009);
    let notifier = RecordingNotifier::default();
    let lease = h.broker.setup(&ctx(), SetupRequest::tcp("node-a"), &notifier).await.unwrap();
    h.broker.teardown(&ctx(), teardown_of("node-a"), &notifier).await.unwrap();

    let ready = notifier.ready.lock().unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].port, lease.port);
    assert_eq!(ready[0].host, "wst-test.example.com");
    let closed = notifier.closed.lock().unwrap();
    assert_eq!(closed[0].port, Some(lease.port));
}

#[tokio::test]
async fn peer_receives_tls_settings() {
    let h = harness(30000, 30009);
    let notifier = RecordingNotifier::default();
    let mut req = SetupRequest::http("node-a", "10.0.0.5:8443");
    req.tls_endpoint = true;
    req.skip_cert_verification = true;
    let lease = h.broker.setup(&ctx(), req, &notifier).await.unwrap();
    assert!(lease.tls_endpoint);

    // skipping verification means nothing for a plain endpoint
    let mut req = SetupRequest::http("node-b", "svc:80");
    req.skip_cert_verification = true;
    h.broker.setup(&ctx(), req, &notifier).await.unwrap();

    let ready = notifier.ready.lock().unwrap();
    assert!(ready[0].tls_endpoint);
    assert!(ready[0].skip_cert_verification);
    assert!(!ready[1].tls_endpoint);
    assert!(!ready[1].skip_cert_verification);
}

#[tokio::test]
async fn basic_auth_http_lease_with_alias() {
    let h = harness(30000, 30009);
    let mut req = SetupRequest::http("node-a", "dashboard:8443");
    req.dns_alias = Some("dash.customer.example".to_string());
    req.generate_basic_auth = true;
    let lease = h.broker.setup(&ctx(), req, &NoopNotifier).await.unwrap();

    assert_eq!(lease.dns_url.as_deref(), Some("https://dash.customer.example"));
    assert_eq!(
        h.aliases.target_of("dash.customer.example").as_deref(),
        Some("wst-test.example.com")
    );
    let secret = h.platform.secret(&format!("wstun-secret-{}", lease.port)).unwrap();
    let auth = lease.basic_auth.unwrap();
    assert_eq!(secret.auth, format!("{}::{}\n", auth.username, auth.password));
    assert_eq!(h.platform.rules_for_port(lease.port), 2);

    let teardown = TeardownRequest {
        node_id: "node-a".to_string(),
        endpoint: "dashboard:8443".to_string(),
        public_key: None,
    };
    h.broker.teardown(&ctx(), teardown, &NoopNotifier).await.unwrap();
    assert!(h.aliases.is_empty());
    assert!(h.platform.secret(&format!("wstun-secret-{}", lease.port)).is_none());
    assert!(h.platform.current_ingress_rules().is_empty());
}

#[tokio::test]
async fn alias_failure_does_not_fail_setup() {
    let h = harness(30000, 30009);
    h.aliases.reject_all(true);
    let mut req = SetupRequest::http("node-a", "svc:80");
    req.derive_dns_alias = true;
    let lease = h.broker.setup(&ctx(), req, &NoopNotifier).await.unwrap();
    assert!(lease.dns_url.is_some());
    assert!(h.aliases.is_empty());
}

#[tokio::test]
async fn shared_object_conflicts_are_retried() {
    let h = harness(30000, 30009);
    h.platform.inject_conflicts(3);
    let lease = h.broker.setup(&ctx(), SetupRequest::tcp("node-a"), &NoopNotifier).await.unwrap();
    assert_eq!(h.platform.rules_for_port(lease.port), 1);
    assert!(h.platform.has_service_port(lease.port));
}
