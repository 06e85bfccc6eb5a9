//! Command-line surface of the `fleetbench` binary.

use clap::{Args, Parser, Subcommand};

use crate::config::FleetConfig;
use crate::coordinator::AbortMode;
use crate::processor::DispatchProfile;

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Coordinator, agent and worker nodes of a distributed stress-test fleet."
)]
pub struct FleetArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Path to config file (TOML/JSON); defaults to ./fleetbench.toml or ./fleetbench.json
    #[arg(long, short = 'c', global = true, env = "FLEETBENCH_CONFIG")]
    pub config: Option<String>,

    /// Enable debug logging (FLEETBENCH_LOG takes precedence)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the root node and drive the configured test plans
    Coordinator(CoordinatorArgs),
    /// Run an agent relaying between the coordinator and its workers
    Agent(AgentArgs),
    /// Run a worker executing the built-in idle workload
    Worker(WorkerArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct CoordinatorArgs {
    /// Address to accept agents on
    #[arg(long)]
    pub listen: Option<String>,

    /// Agents required before the first test starts
    #[arg(long = "min-agents")]
    pub min_agents: Option<usize>,

    /// Which report handlers to install
    #[arg(long, value_enum)]
    pub profile: Option<DispatchProfile>,

    /// When a failure aborts the run
    #[arg(long = "abort-policy", value_enum)]
    pub abort_policy: Option<AbortMode>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct AgentArgs {
    /// Agent index (1-based)
    #[arg(long)]
    pub index: Option<u32>,

    /// Address to accept workers on
    #[arg(long)]
    pub listen: Option<String>,

    /// Coordinator address
    #[arg(long)]
    pub coordinator: Option<String>,

    /// Workers to wait for before serving
    #[arg(long = "min-workers")]
    pub min_workers: Option<usize>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct WorkerArgs {
    /// Index of the agent this worker belongs to
    #[arg(long = "agent-index")]
    pub agent_index: Option<u32>,

    /// Worker index under its agent (1-based)
    #[arg(long)]
    pub index: Option<u32>,

    /// Agent address
    #[arg(long)]
    pub agent: Option<String>,

    /// Time the idle workload spends in RUN, in milliseconds
    #[arg(long = "run-duration-ms")]
    pub run_duration_ms: Option<u64>,
}

impl Command {
    /// Overlays flags given on the command line onto `config`.
    pub fn apply_overrides(&self, config: &mut FleetConfig) {
        match self {
            Command::Coordinator(args) => {
                let section = &mut config.coordinator;
                if let Some(listen) = &args.listen {
                    section.listen.clone_from(listen);
                }
                if let Some(min_agents) = args.min_agents {
                    section.min_agents = min_agents;
                }
                if let Some(profile) = args.profile {
                    section.dispatch_profile = profile;
                }
                if let Some(abort_policy) = args.abort_policy {
                    section.abort_policy = abort_policy;
                }
            }
            Command::Agent(args) => {
                let section = &mut config.agent;
                if let Some(index) = args.index {
                    section.index = index;
                }
                if let Some(listen) = &args.listen {
                    section.listen.clone_from(listen);
                }
                if let Some(coordinator) = &args.coordinator {
                    section.coordinator.clone_from(coordinator);
                }
                if let Some(min_workers) = args.min_workers {
                    section.min_workers = min_workers;
                }
            }
            Command::Worker(args) => {
                let section = &mut config.worker;
                if let Some(agent_index) = args.agent_index {
                    section.agent_index = agent_index;
                }
                if let Some(index) = args.index {
                    section.index = index;
                }
                if let Some(agent) = &args.agent {
                    section.agent.clone_from(agent);
                }
                if let Some(run_duration_ms) = args.run_duration_ms {
                    section.run_duration_ms = run_duration_ms;
                }
            }
        }
    }
}
