use clap::{Args, Parser, Subcommand};
use common::{
    CallerContext, ErrorBody, HeaderOverride, LeaseResult, LeaseView, SetupEnvelope, SetupRequest, SweepReport,
    TeardownEnvelope, TeardownRequest,
};
use reqwest::{Client, Response};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Broker base URL
    #[arg(long, env = "BROKER_URL", default_value = "http://localhost:3030")]
    url: String,

    /// Tenant the tunnels belong to
    #[arg(long, env = "BROKER_TENANT", default_value = "default")]
    tenant: String,

    /// Act as the HTTP service proxy flow
    #[arg(long)]
    service_proxy: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Target {
    /// Target node id
    node_id: String,

    /// host:port on the node for an HTTP tunnel; omit for an SSH tunnel
    #[arg(long, default_value = "")]
    endpoint: String,
}

#[derive(Args, Clone)]
struct SetupOpts {
    #[command(flatten)]
    target: Target,

    /// Lease duration in seconds (default: 1800)
    #[arg(long)]
    duration: Option<u64>,

    /// Reuse this public key instead of minting a new keypair
    #[arg(long)]
    public_key: Option<String>,

    /// Write a minted private key to this file
    #[arg(long)]
    key_out: Option<PathBuf>,

    /// Front the endpoint with generated basic auth credentials
    #[arg(long)]
    basic_auth: bool,

    /// Custom DNS alias for the endpoint
    #[arg(long, conflicts_with = "derive_dns")]
    dns_alias: Option<String>,

    /// Publish the per-endpoint DNS name derived from the broker host
    #[arg(long)]
    derive_dns: bool,

    #[arg(long)]
    no_rewrite: bool,

    /// Header override as NAME=VALUE, repeatable
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<HeaderOverride>,

    /// The endpoint on the node serves TLS
    #[arg(long)]
    tls_endpoint: bool,

    /// Do not verify the endpoint's certificate
    #[arg(long, requires = "tls_endpoint")]
    skip_cert_verification: bool,
}

#[derive(Args, Clone)]
struct TeardownOpts {
    #[command(flatten)]
    target: Target,

    /// End only this client's session; other clients on the lease keep it
    #[arg(long)]
    public_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Set up (or refresh) a tunnel
    Setup(SetupOpts),
    /// Tear down a tunnel
    Teardown(TeardownOpts),
    /// List all leases
    List,
    /// Run a garbage collection sweep now
    Sweep,
    /// Set up a tunnel and keep refreshing it until interrupted or the
    /// command exits, then tear it down
    Keep {
        #[command(flatten)]
        setup: SetupOpts,

        /// Refresh interval in seconds
        #[arg(long, default_value_t = 60)]
        every: u64,

        /// Environment variable name for the port (default: TUNNEL_PORT)
        #[arg(long, default_value = "TUNNEL_PORT")]
        env_name: String,

        /// Command and arguments to execute while the tunnel is up
        #[arg(last = true)]
        command: Vec<String>,
    },
}

fn parse_header(raw: &str) -> Result<HeaderOverride, String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    Ok(HeaderOverride {
        name: name.to_string(),
        value: value.to_string(),
    })
}

struct Broker {
    client: Client,
    url: String,
    context: CallerContext,
}

impl Broker {
    async fn setup(&self, request: SetupRequest) -> Result<LeaseResult, Box<dyn std::error::Error>> {
        let envelope = SetupEnvelope {
            context: self.context.clone(),
            request,
        };
        let resp = self
            .client
            .post(format!("{}/tunnels/setup", self.url))
            .json(&envelope)
            .send()
            .await?;
        Ok(checked(resp).await?.json().await?)
    }

    async fn teardown(&self, request: TeardownRequest) -> Result<(), Box<dyn std::error::Error>> {
        let envelope = TeardownEnvelope {
            context: self.context.clone(),
            request,
        };
        let resp = self
            .client
            .post(format!("{}/tunnels/teardown", self.url))
            .json(&envelope)
            .send()
            .await?;
        checked(resp).await?;
        Ok(())
    }
}

async fn checked(resp: Response) -> Result<Response, Box<dyn std::error::Error>> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) => Err(format!("{} ({}): {}", body.kind, status, body.message).into()),
        Err(_) => Err(format!("broker returned {status}").into()),
    }
}

fn setup_request(opts: &SetupOpts) -> SetupRequest {
    SetupRequest {
        node_id: opts.target.node_id.clone(),
        endpoint: opts.target.endpoint.clone(),
        public_key: opts.public_key.clone(),
        duration_secs: opts.duration,
        basic_auth: None,
        generate_basic_auth: opts.basic_auth,
        dns_alias: opts.dns_alias.clone(),
        derive_dns_alias: opts.derive_dns,
        rewrite_rules_disabled: opts.no_rewrite,
        header_overrides: opts.headers.clone(),
        tls_endpoint: opts.tls_endpoint,
        skip_cert_verification: opts.skip_cert_verification,
    }
}

fn teardown_request(opts: &TeardownOpts) -> TeardownRequest {
    TeardownRequest {
        node_id: opts.target.node_id.clone(),
        endpoint: opts.target.endpoint.clone(),
        public_key: opts.public_key.clone(),
    }
}

fn print_lease(lease: &LeaseResult, key_out: Option<&PathBuf>) -> std::io::Result<()> {
    println!("Port: {}", lease.port);
    println!("Host: {}", lease.host);
    println!("Expires: {}", lease.expires_at);
    if let Some(url) = &lease.url {
        println!("URL: {url}");
    }
    if let Some(dns_url) = &lease.dns_url {
        println!("DNS URL: {dns_url}");
    }
    if let Some(auth) = &lease.basic_auth {
        println!("Basic auth: {}:{}", auth.username, auth.password);
    }
    if lease.tls_endpoint {
        println!("TLS endpoint (verify certificate: {})", !lease.skip_cert_verification);
    }
    println!("Public key: {}", lease.public_key);
    if let Some(private_key) = &lease.private_key {
        match key_out {
            Some(path) => {
                std::fs::write(path, private_key)?;
                println!("Private key written to {}", path.display());
            }
            None => println!("{private_key}"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut context = CallerContext::allowed(cli.tenant.clone());
    context.service_proxy = cli.service_proxy;
    let broker = Broker {
        client: Client::new(),
        url: cli.url.trim_end_matches('/').to_string(),
        context,
    };

    match cli.command {
        Commands::Setup(opts) => {
            let lease = broker.setup(setup_request(&opts)).await?;
            print_lease(&lease, opts.key_out.as_ref())?;
        }
        Commands::Teardown(opts) => {
            broker.teardown(teardown_request(&opts)).await?;
            println!("Tunnel to {} torn down", opts.target.node_id);
        }
        Commands::List => {
            let resp = broker.client.get(format!("{}/leases", broker.url)).send().await?;
            let leases: Vec<LeaseView> = checked(resp).await?.json().await?;
            println!("Leases:");
            for lease in leases {
                println!(
                    "Port: {}, Lease: {}, State: {}, Expires: {}",
                    lease.port, lease.key, lease.state, lease.expires_at
                );
            }
        }
        Commands::Sweep => {
            let resp = broker.client.post(format!("{}/sweep", broker.url)).send().await?;
            let report: SweepReport = checked(resp).await?.json().await?;
            println!(
                "Candidates: {}, reclaimed: {:?}, skipped: {}",
                report.candidates, report.reclaimed, report.skipped
            );
        }
        Commands::Keep {
            setup,
            every,
            env_name,
            command,
        } => {
            let lease = broker.setup(setup_request(&setup)).await?;
            print_lease(&lease, setup.key_out.as_ref())?;

            // refreshes must keep the same key, otherwise a new keypair is minted
            let mut refresh = setup_request(&setup);
            refresh.public_key = Some(lease.public_key.clone());

            let mut child = match command.split_first() {
                Some((cmd, args)) => {
                    println!("Running: {} {:?} with {}={}", cmd, args, env_name, lease.port);
                    Some(
                        Command::new(cmd)
                            .args(args)
                            .env(&env_name, lease.port.to_string())
                            .stdin(Stdio::inherit())
                            .stdout(Stdio::inherit())
                            .stderr(Stdio::inherit())
                            .spawn()?,
                    )
                }
                None => None,
            };

            let mut interval = time::interval(Duration::from_secs(every.max(1)));
            interval.tick().await;
            let mut exit_code = 0;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match broker.setup(refresh.clone()).await {
                            Ok(l) => println!("Refreshed port {} until {}", l.port, l.expires_at),
                            Err(e) => {
                                eprintln!("Refresh failed: {e}");
                                exit_code = 1;
                                break;
                            }
                        }
                    }
                    status = async {
                        match child.as_mut() {
                            Some(c) => c.wait().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        exit_code = match status {
                            Ok(s) => s.code().unwrap_or(1),
                            Err(e) => {
                                eprintln!("Failed to run command: {e}");
                                1
                            }
                        };
                        break;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        println!("Interrupted");
                        break;
                    }
                }
            }

            if let Some(mut c) = child {
                let _ = c.kill().await;
            }
            match broker
                .teardown(TeardownRequest::from(&refresh))
                .await
            {
                Ok(()) => println!("Released port {}", lease.port),
                Err(e) => eprintln!("Teardown failed: {e}"),
            }
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }
    }

    Ok(())
}
