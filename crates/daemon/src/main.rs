use anyhow::Context;
use broker_daemon::{
    api::{self, AppState},
    config::{Args, PlatformKind},
    db::{self, LeaseStore},
    dns::{AliasManager, NoopAliases, WebhookAliases},
    notify::{NoopNotifier, Notifier, WebhookNotifier},
    platform::{KubePlatform, MemoryPlatform, Platform},
    Broker,
};
use clap::Parser;
use std::{sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.broker_config().context("invalid configuration")?;

    let db_path = args.db_path.clone().unwrap_or_else(db::default_db_path);
    tracing::info!(path = %db_path.display(), "Using lease database");
    let store = Arc::new(
        LeaseStore::open(&db_path)
            .with_context(|| format!("failed to open lease database {}", db_path.display()))?,
    );

    let platform: Arc<dyn Platform> = match args.platform {
        PlatformKind::Memory => {
            tracing::warn!("Using in-memory platform, routes are not persisted");
            Arc::new(MemoryPlatform::new())
        }
        PlatformKind::Kubernetes => Arc::new(
            KubePlatform::in_cluster(args.namespace.clone(), &args.shared_service, &args.ingress)
                .context("failed to configure in-cluster platform client")?,
        ),
    };

    let notifier: Arc<dyn Notifier> = match &args.notify_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url, Duration::from_secs(args.notify_timeout_secs))
                .context("failed to build notification client")?,
        ),
        None => {
            tracing::info!("No notify URL configured, peer notifications disabled");
            Arc::new(NoopNotifier)
        }
    };

    let aliases: Arc<dyn AliasManager> = match &args.dns_url {
        Some(url) => Arc::new(
            WebhookAliases::new(url, args.dns_token.clone(), Duration::from_secs(args.dns_timeout_secs))
                .context("failed to build DNS provider client")?,
        ),
        None => {
            tracing::info!("No DNS provider configured, aliases are not published");
            Arc::new(NoopAliases)
        }
    };

    let sweep_interval = config.sweep_interval;
    tracing::info!(
        min_port = config.min_port,
        max_port = config.max_port,
        host = %config.ingress_host(),
        notify_policy = ?config.notify_policy,
        "Broker configured"
    );
    let broker = Arc::new(Broker::new(config, store, platform, aliases));

    // first tick runs immediately, which doubles as the startup sweep
    broker.gc().spawn_periodic(sweep_interval);

    let app = api::router(AppState { broker, notifier });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!(addr = %args.listen, "Listening");
    axum::serve(listener, app).await?;
    Ok(())
}
