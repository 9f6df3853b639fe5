//! agentmesh command line
//!
//! Validates orchestrator configuration files and runs a local simulation
//! of the routing core against mock agents.

use agentmesh::config::OrchestratorConfig;
use agentmesh::observability::init_default_logging;
use agentmesh::routing::{Task, TaskPriority};
use agentmesh::testing::{agent_metadata, MockTransport};
use agentmesh::Orchestrator;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["agentmesh.toml", "config/agentmesh.toml"];
const SIMULATED_CAPABILITIES: [&str; 4] = ["summarize", "translate", "classify", "extract"];

/// Capability-aware task routing core
#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(about = "Route tasks across a large fleet of remote agents")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "AGENTMESH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Route synthetic tasks across mock agents and print the metrics
    Simulate {
        /// Number of agents to register
        #[arg(long, default_value_t = 20)]
        agents: usize,
        /// Number of tasks to route
        #[arg(long, default_value_t = 200)]
        tasks: usize,
        /// Fraction of invocations that fail
        #[arg(long, default_value_t = 0.05)]
        failure_rate: f64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let result = match cli.command {
        Commands::Config { show } => handle_config_command(cli.config.as_deref(), show),
        Commands::Simulate {
            agents,
            tasks,
            failure_rate,
        } => simulate(cli.config.as_deref(), agents, tasks, failure_rate).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn find_config(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()),
    }
}

fn load_configuration(path: &Path) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    info!("Loading configuration from: {}", path.display());
    Ok(OrchestratorConfig::load_from_file(path)?)
}

fn handle_config_command(
    explicit: Option<&Path>,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(path) = find_config(explicit) else {
        return Err(
            "No configuration file found. Provide one with -c/--config or create agentmesh.toml"
                .into(),
        );
    };
    let config = load_configuration(&path)?;

    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration is valid");
    Ok(())
}

async fn simulate(
    explicit: Option<&Path>,
    agents: usize,
    tasks: usize,
    failure_rate: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    if !(0.0..=1.0).contains(&failure_rate) {
        return Err(format!("--failure-rate must be in [0, 1], got {failure_rate}").into());
    }

    let config = match find_config(explicit) {
        Some(path) => load_configuration(&path)?,
        None => OrchestratorConfig::default(),
    };

    let transport = Arc::new(MockTransport::with_failure_rate(failure_rate));
    let orchestrator = Arc::new(Orchestrator::new(config, transport)?);

    let n = SIMULATED_CAPABILITIES.len();
    for i in 0..agents {
        let caps = [SIMULATED_CAPABILITIES[i % n], SIMULATED_CAPABILITIES[(i + 1) % n]];
        let caps: &[&str] = if i % 3 == 0 { &caps[..1] } else { &caps };
        orchestrator
            .register_agent(agent_metadata(&format!("agent-{i:04}"), caps))
            .await?;
    }
    info!(agents, tasks, failure_rate, "Starting simulation");

    let mut running = JoinSet::new();
    for j in 0..tasks {
        let orchestrator = Arc::clone(&orchestrator);
        let priority = match j % 10 {
            0 => TaskPriority::High,
            9 => TaskPriority::Low,
            _ => TaskPriority::Normal,
        };
        let task = Task::new("simulated", [SIMULATED_CAPABILITIES[j % n]]).with_priority(priority);
        running.spawn(async move { orchestrator.route_task(&task).await });
    }

    let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
    while let Some(joined) = running.join_next().await {
        let key = match joined {
            Ok(Ok(_)) => "completed".to_string(),
            Ok(Err(e)) => e.kind().to_string(),
            Err(e) => {
                warn!("Simulated task panicked: {}", e);
                "panicked".to_string()
            }
        };
        *outcomes.entry(key).or_insert(0) += 1;
    }

    info!(?outcomes, "Simulation finished");
    println!("{}", serde_json::to_string_pretty(&orchestrator.get_metrics())?);
    orchestrator.shutdown().await;
    Ok(())
}
