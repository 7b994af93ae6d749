use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use iglu_scheduler::broker::{
    MemoryBroker, QueueStore, RedisBroker, CHANNEL_BUILD, CHANNEL_NODE,
};
use iglu_scheduler::config::{BrokerConfig, ControllerConfig, ExecutorConfig, ExpirePolicy};
use iglu_scheduler::executor::BuildServer;
use iglu_scheduler::http::{self, ApiState};
use iglu_scheduler::ingest::{FileBuilderStore, Ingestor};
use iglu_scheduler::registry::NodeRegistry;
use iglu_scheduler::scheduler::job::{BuildChannelMessage, NodeChannelMessage};
use iglu_scheduler::scheduler::{ClaimCoordinator, Janitor};
use iglu_scheduler::shutdown::shutdown_token;

#[derive(Parser, Debug)]
#[command(name = "iglu-scheduler")]
#[command(version)]
#[command(about = "Distributed build-job orchestration for a Nix binary-cache platform")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the controller (claim, webhook and cleanup API plus the janitor)
    Controller(ControllerArgs),

    /// Run a build node (executor WebSocket server)
    Node(NodeArgs),
}

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Address to serve the controller API on
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Shared operator secret for the cleanup/cancel/register/healthcheck endpoints
    #[arg(long)]
    operator_psk: String,

    /// JSON file with builder configurations (webhook tokens resolve against it)
    #[arg(long)]
    builders: Option<PathBuf>,

    /// Queue entries older than this many seconds are evicted by the janitor
    #[arg(long, default_value = "900")]
    staleness_window_secs: u64,

    /// Seconds between background janitor sweeps
    #[arg(long, default_value = "60")]
    sweep_interval_secs: u64,

    /// Mark the job row failed when the janitor evicts its queue entry
    #[arg(long)]
    mark_failed_on_expiry: bool,

    /// Upper bound of the claim jitter in milliseconds
    #[arg(long, default_value = "1000")]
    claim_jitter_ms: u64,

    #[command(flatten)]
    broker: BrokerArgs,
}

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Address to serve the build connection on
    #[arg(long, default_value = "127.0.0.1:3001")]
    listen: SocketAddr,

    /// Stable identity this node registers and claims under
    #[arg(long)]
    node_id: String,

    /// Pre-shared secret for this node
    #[arg(long)]
    node_psk: String,

    /// Architectures this node builds for (comma-separated)
    #[arg(long, default_value = "x86_64", value_delimiter = ',')]
    arch: Vec<String>,

    /// Build driver invoked as `<program> --json <spec>`
    #[arg(long, default_value = "/usr/lib/iglu/build")]
    build_program: PathBuf,

    #[command(flatten)]
    broker: BrokerArgs,
}

#[derive(Parser, Debug)]
struct BrokerArgs {
    #[arg(long, default_value = "127.0.0.1")]
    redis_host: String,

    #[arg(long, default_value = "6379")]
    redis_port: u16,

    #[arg(long, default_value = "")]
    redis_user: String,

    #[arg(long, default_value = "")]
    redis_password: String,

    /// Use an in-memory queue store instead of Redis (single-process only)
    #[arg(long)]
    in_memory: bool,
}

impl BrokerArgs {
    async fn connect(&self) -> Result<Arc<dyn QueueStore>, Box<dyn std::error::Error>> {
        if self.in_memory {
            tracing::warn!("Using in-memory queue store; state is not shared across processes");
            return Ok(Arc::new(MemoryBroker::new()));
        }
        let cfg = BrokerConfig {
            user: self.redis_user.clone(),
            password: self.redis_password.clone(),
            host: self.redis_host.clone(),
            port: self.redis_port,
        };
        Ok(Arc::new(RedisBroker::connect(&cfg.url()).await?))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let shutdown = shutdown_token();

    match args.command {
        Commands::Controller(args) => run_controller(args, shutdown).await,
        Commands::Node(args) => run_node(args, shutdown).await,
    }
}

async fn run_controller(
    args: ControllerArgs,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ControllerConfig {
        listen_addr: args.listen,
        operator_psk: args.operator_psk,
        staleness_window: Duration::from_secs(args.staleness_window_secs),
        sweep_interval: Duration::from_secs(args.sweep_interval_secs),
        claim_jitter_ms: args.claim_jitter_ms,
        builders_file: args.builders,
        expire_policy: if args.mark_failed_on_expiry {
            ExpirePolicy::MarkFailed
        } else {
            ExpirePolicy::LeaveCreated
        },
        ..Default::default()
    };

    let broker = args.broker.connect().await?;
    let registry = Arc::new(NodeRegistry::new(broker.clone()));
    let coordinator = Arc::new(ClaimCoordinator::new(
        registry.clone(),
        broker.clone(),
        config.claim_jitter_ms,
    ));
    let store = match &config.builders_file {
        Some(path) => FileBuilderStore::from_path(path)?,
        None => FileBuilderStore::empty(),
    };
    let ingestor = Arc::new(Ingestor::new(Arc::new(store), broker.clone()));
    let janitor = Arc::new(Janitor::new(
        broker.clone(),
        config.staleness_window,
        config.expire_policy,
    ));

    // Background janitor alongside the on-demand cleanup endpoint.
    let background_janitor = Janitor::new(broker, config.staleness_window, config.expire_policy);
    let janitor_shutdown = shutdown.clone();
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        background_janitor.run(sweep_interval, janitor_shutdown).await;
    });

    let state = ApiState {
        registry,
        coordinator,
        ingestor,
        janitor,
        operator_psk: config.operator_psk.clone(),
        healthcheck_wait: config.healthcheck_wait,
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "Starting controller API");
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn run_node(
    args: NodeArgs,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ExecutorConfig {
        listen_addr: args.listen,
        node_id: args.node_id.clone(),
        node_psk: args.node_psk.clone(),
        arch: args.arch.clone(),
        build_program: args.build_program,
    };

    let broker = args.broker.connect().await?;
    let registry = NodeRegistry::new(broker.clone());
    registry
        .register(&config.node_id, &config.node_psk, config.arch.clone())
        .await?;

    let server = BuildServer::new(config.clone());

    tokio::spawn(forward_cancellations(
        broker.clone(),
        server.cancel_sender(),
        shutdown.clone(),
    ));
    tokio::spawn(answer_health_checks(
        broker,
        config.node_id.clone(),
        shutdown.clone(),
    ));

    server.run(shutdown).await?;
    Ok(())
}

/// Relay cancel broadcasts from the build channel into the executor.
async fn forward_cancellations(
    broker: Arc<dyn QueueStore>,
    cancel_tx: broadcast::Sender<Uuid>,
    shutdown: CancellationToken,
) {
    let mut stream = match broker.subscribe(CHANNEL_BUILD).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "Failed to subscribe to build channel");
            return;
        }
    };
    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            _ = shutdown.cancelled() => break,
        };
        let Some(msg) = msg else { break };
        if let Ok(BuildChannelMessage::Cancel { job_id }) = serde_json::from_str(&msg) {
            // A send error only means no build is active right now.
            let _ = cancel_tx.send(job_id);
        }
    }
}

/// Respond to controller health checks addressed to this node.
async fn answer_health_checks(
    broker: Arc<dyn QueueStore>,
    node_id: String,
    shutdown: CancellationToken,
) {
    let mut stream = match broker.subscribe(CHANNEL_NODE).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "Failed to subscribe to node channel");
            return;
        }
    };
    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            _ = shutdown.cancelled() => break,
        };
        let Some(msg) = msg else { break };
        match serde_json::from_str::<NodeChannelMessage>(&msg) {
            Ok(NodeChannelMessage::HealthCheck { target, .. }) if target == node_id => {
                let response = NodeChannelMessage::HealthCheck {
                    sender: node_id.clone(),
                    target: "controller".to_string(),
                };
                let Ok(payload) = serde_json::to_string(&response) else {
                    continue;
                };
                if let Err(e) = broker.publish(CHANNEL_NODE, &payload).await {
                    tracing::error!(error = %e, "Failed to answer health check");
                }
            }
            Ok(NodeChannelMessage::Deregister { target, .. }) if target == node_id => {
                tracing::warn!("Controller asked this node to deregister");
            }
            _ => {}
        }
    }
}
