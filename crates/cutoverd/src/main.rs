//! cutoverd — the upgrade orchestrator daemon.
//!
//! Single binary that assembles the orchestrator subsystems:
//! - State store (redb)
//! - Backup manager
//! - Health prober
//! - Session manager
//! - REST API + SSE event streams
//!
//! # Usage
//!
//! ```text
//! cutoverd standalone --port 8700 --data-dir /var/lib/cutover \
//!     --agent payments=1.4.2:4@10.0.0.12:9100
//! ```
//!
//! Traffic actuation runs against the in-process simulated fleet until a
//! real actuator implements the `Fleet` trait; health probes hit the
//! agent addresses given on the command line unless `--dry-run`
//! substitutes synthesized healthy verdicts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cutover_backup::{BackupManager, FileSnapshotSource};
use cutover_health::{
    CheckFuture, CheckKind, CheckRunner, HealthProber, HttpCheckRunner,
};
use cutover_session::{
    LogSink, OrchestratorConfig, SessionContext, SessionManager, SimFleet, StoreCatalog,
};
use cutover_state::{CheckStatus, HealthCheck, StateStore, epoch_secs};

#[derive(Parser)]
#[command(name = "cutoverd", about = "Zero-downtime agent upgrade orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single-node, all subsystems in one process).
    Standalone {
        /// Port to listen on.
        #[arg(long, default_value = "8700")]
        port: u16,

        /// Data directory for persistent state and agent snapshots.
        #[arg(long, default_value = "/var/lib/cutover")]
        data_dir: PathBuf,

        /// Backup blob directory (defaults to `<data-dir>/backups`).
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Managed agent, repeatable: `id=version:instances@host:port`.
        #[arg(long = "agent")]
        agents: Vec<String>,

        /// Health sampling interval during cutover, in seconds.
        #[arg(long, default_value = "5")]
        probe_interval_secs: u64,

        /// Post-cutover verification window, in seconds.
        #[arg(long, default_value = "15")]
        verify_window_secs: u64,

        /// Watchdog limit on total session duration, in seconds.
        #[arg(long, default_value = "3600")]
        max_session_secs: u64,

        /// Synthesize healthy probe verdicts instead of contacting agents.
        #[arg(long)]
        dry_run: bool,
    },
}

/// One `--agent` flag, parsed.
#[derive(Debug, PartialEq)]
struct AgentSpec {
    id: String,
    version: String,
    instances: u32,
    address: String,
}

fn parse_agent_spec(spec: &str) -> anyhow::Result<AgentSpec> {
    let (id, rest) = spec
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("agent spec '{spec}' is missing '='"))?;
    let (fleet, address) = rest
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("agent spec '{spec}' is missing '@host:port'"))?;
    let (version, instances) = fleet
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("agent spec '{spec}' is missing ':instances'"))?;
    Ok(AgentSpec {
        id: id.to_string(),
        version: version.to_string(),
        instances: instances
            .parse()
            .map_err(|_| anyhow::anyhow!("agent spec '{spec}' has a bad instance count"))?,
        address: address.to_string(),
    })
}

/// Dry-run prober: every check passes with nominal metrics.
struct DryRunCheckRunner;

impl CheckRunner for DryRunCheckRunner {
    fn run<'a>(&'a self, _agent_id: &'a str, check: CheckKind) -> CheckFuture<'a> {
        Box::pin(async move {
            Ok(HealthCheck {
                name: check.name().to_string(),
                status: CheckStatus::Pass,
                message: "dry run".to_string(),
                metrics: HashMap::new(),
                checked_at: epoch_secs(),
            })
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cutoverd=debug,cutover=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            port,
            data_dir,
            backup_dir,
            agents,
            probe_interval_secs,
            verify_window_secs,
            max_session_secs,
            dry_run,
        } => {
            run_standalone(
                port,
                data_dir,
                backup_dir,
                agents,
                OrchestratorConfig {
                    probe_interval: Duration::from_secs(probe_interval_secs),
                    verify_window: Duration::from_secs(verify_window_secs),
                    max_session_duration: Duration::from_secs(max_session_secs),
                },
                dry_run,
            )
            .await
        }
    }
}

async fn run_standalone(
    port: u16,
    data_dir: PathBuf,
    backup_dir: Option<PathBuf>,
    agent_specs: Vec<String>,
    config: OrchestratorConfig,
    dry_run: bool,
) -> anyhow::Result<()> {
    info!("cutover daemon starting in standalone mode");

    let agents_dir = data_dir.join("agents");
    std::fs::create_dir_all(&agents_dir)?;
    let db_path = data_dir.join("cutover.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let fleet = SimFleet::new();
    let mut addresses = HashMap::new();
    for spec in &agent_specs {
        let agent = parse_agent_spec(spec)?;
        fleet.register(&agent.id, &agent.version, agent.instances);
        addresses.insert(agent.id.clone(), agent.address.clone());
        info!(
            agent_id = %agent.id,
            version = %agent.version,
            instances = agent.instances,
            address = %agent.address,
            "agent registered"
        );
    }

    let runner: Arc<dyn CheckRunner> = if dry_run {
        info!("dry run: health probes are synthesized");
        Arc::new(DryRunCheckRunner)
    } else {
        Arc::new(HttpCheckRunner::new(addresses))
    };
    let prober = Arc::new(HealthProber::new(runner));
    info!("health prober initialized");

    let backup_root = backup_dir.unwrap_or_else(|| data_dir.join("backups"));
    let backups = BackupManager::new(
        &backup_root,
        store.clone(),
        Arc::new(FileSnapshotSource::new(&agents_dir)),
    )?;
    info!(path = ?backup_root, "backup manager initialized");

    let ctx = SessionContext {
        store: store.clone(),
        prober,
        fleet,
        backups: Arc::new(backups),
        catalog: Arc::new(StoreCatalog::new(store)),
        notifier: Arc::new(LogSink),
    };
    let manager = SessionManager::new(ctx, config);
    info!("session manager initialized");

    // Sessions left non-terminal by a previous run cannot be resumed;
    // close them out before accepting new work.
    let recovered = manager.recover_interrupted()?;
    if !recovered.is_empty() {
        warn!(
            count = recovered.len(),
            "finalized sessions interrupted by the previous run"
        );
    }

    // ── Start API server ───────────────────────────────────────

    let router = cutover_api::build_router(manager);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C. Running session tasks are dropped
    // with the runtime; their state is already durable in the store.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
    });

    server.await?;

    info!("cutover daemon stopped");
    Ok(())
}
