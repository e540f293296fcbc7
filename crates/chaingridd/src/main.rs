//! chaingridd — the ChainGrid daemon.
//!
//! Single binary that assembles one ChainGrid node:
//! - State store (redb)
//! - Event bus and cluster map
//! - Remote agent registry
//! - Local agents executing process chains
//! - Scheduler
//!
//! # Usage
//!
//! ```text
//! chaingridd run --config /etc/chaingrid/chaingrid.toml --data-dir /var/lib/chaingrid
//! chaingridd setups --config /etc/chaingrid/chaingrid.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chaingrid_agent::{AgentService, AgentServiceConfig, LocalAgent, RemoteAgentRegistry};
use chaingrid_bus::{EventBus, InMemoryClusterMap};
use chaingrid_cloud::{SetupSelector, load_setups, validate_setups};
use chaingrid_scheduler::Scheduler;
use chaingrid_state::StateStore;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::NodeConfig;

#[derive(Parser)]
#[command(name = "chaingridd", about = "ChainGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node: local agents and the scheduler.
    Run {
        /// Node configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/chaingrid")]
        data_dir: PathBuf,
    },
    /// Validate the setups file and print the VMs a cold start would create.
    Setups {
        /// Node configuration file.
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chaingridd=debug,chaingrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, data_dir } => {
            let config = match config {
                Some(path) => NodeConfig::from_file(&path)
                    .with_context(|| format!("could not load {}", path.display()))?,
                None => NodeConfig::default(),
            };
            run_node(config, data_dir).await
        }
        Command::Setups { config } => {
            let config = NodeConfig::from_file(&config)
                .with_context(|| format!("could not load {}", config.display()))?;
            check_setups(&config).await
        }
    }
}

async fn run_node(config: NodeConfig, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("ChainGrid daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("chaingrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let bus = EventBus::new();
    let cluster = Arc::new(InMemoryClusterMap::new());

    let agents = RemoteAgentRegistry::new(bus.clone()).with_request_timeout(config.request_timeout());
    let registry_handle = agents.start().await;
    info!("agent registry started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // ── Local agents ───────────────────────────────────────────

    let agent_ids = config.agent.agent_ids();
    if agent_ids.is_empty() {
        warn!("no agent id configured, not starting local agents");
    }
    for id in agent_ids {
        let service_config = AgentServiceConfig::new(id.clone(), config.agent.capabilities.clone())
            .with_busy_timeout(Duration::from_secs(config.agent.busy_timeout_secs));
        let executor = LocalAgent::new(id.clone())
            .with_output_lines(config.agent.output_lines_to_collect);
        let service = AgentService::new(service_config, Arc::new(executor), bus.clone());
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { service.run(shutdown).await }));
        info!(agent = %id, capabilities = %config.agent.capabilities, "local agent started");
    }

    // ── Scheduler ──────────────────────────────────────────────

    if config.scheduler.enabled {
        let scheduler = Scheduler::new(
            config.scheduler_config(),
            Arc::new(state.clone()),
            Arc::new(agents.clone()),
            bus.clone(),
            cluster,
        )?;
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = scheduler.run(shutdown).await {
                error!(error = %e, "scheduler stopped with an error");
            }
        }));
        info!("scheduler started");
    }

    // ── Shutdown signal ────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    registry_handle.abort();

    info!("ChainGrid daemon stopped");
    Ok(())
}

async fn check_setups(config: &NodeConfig) -> anyhow::Result<()> {
    let path = config
        .cloud
        .setups_file
        .as_deref()
        .context("no setups file configured in [cloud]")?;
    let setups = load_setups(path).with_context(|| format!("could not load {}", path.display()))?;
    validate_setups(&setups, &config.cloud)?;

    for setup in &setups {
        println!(
            "{:<20} flavor={} capabilities={} min={} max={} max_create_concurrent={}",
            setup.id,
            setup.flavor,
            setup.provided_capabilities,
            setup.min_vms,
            setup.max_vms,
            setup.max_create_concurrent()
        );
    }

    let store = StateStore::open_in_memory()?;
    let selector = SetupSelector::new(Arc::new(store), config.cloud.agent_pool.clone());
    let minimum = selector.select_minimum(&setups, false).await?;
    println!("cold start creates {} VM(s)", minimum.len());
    for setup in &minimum {
        println!("  {}", setup.id);
    }
    Ok(())
}
