use std::time::Duration;

use serde::Deserialize;

use crate::broker::{
    BrokerOptions, DEFAULT_DISPATCH_POOL_SIZE, DEFAULT_HELLO_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
use crate::coordinator::{
    AbortMode, CoordinatorOptions, DEFAULT_SERIES_CAPACITY, DEFAULT_STALENESS_WINDOW, TestPlan,
    TimeoutAction,
};
use crate::error::{AppError, AppResult, ConfigError};
use crate::processor::DispatchProfile;
use crate::protocol::{AddressLevel, SimulatorAddress, TestId, TestPhase};
use crate::utils::duration_to_ms;
use crate::worker::{DEFAULT_PERFORMANCE_INTERVAL, WorkerOptions};

pub const DEFAULT_COORDINATOR_LISTEN: &str = "127.0.0.1:7100";
pub const DEFAULT_AGENT_LISTEN: &str = "127.0.0.1:7101";
const DEFAULT_AGENT_WAIT_MS: u64 = 30_000;
const DEFAULT_WORKER_WAIT_MS: u64 = 30_000;
const DEFAULT_PHASE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_RUN_DURATION_MS: u64 = 10_000;

/// Whole-fleet configuration file. Every section and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub broker: BrokerConfig,
    pub coordinator: CoordinatorConfig,
    pub agent: AgentConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub request_timeout_ms: u64,
    pub hello_timeout_ms: u64,
    pub dispatch_pool_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: duration_to_ms(DEFAULT_REQUEST_TIMEOUT),
            hello_timeout_ms: duration_to_ms(DEFAULT_HELLO_TIMEOUT),
            dispatch_pool_size: DEFAULT_DISPATCH_POOL_SIZE,
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub const fn options(&self) -> BrokerOptions {
        BrokerOptions {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            hello_timeout: Duration::from_millis(self.hello_timeout_ms),
            dispatch_pool_size: self.dispatch_pool_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub listen: String,
    pub dispatch_profile: DispatchProfile,
    pub abort_policy: AbortMode,
    pub min_agents: usize,
    pub agent_wait_timeout_ms: u64,
    pub staleness_window_ms: u64,
    pub series_capacity: usize,
    pub tests: Vec<TestPlanConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_COORDINATOR_LISTEN.to_owned(),
            dispatch_profile: DispatchProfile::Full,
            abort_policy: AbortMode::FailFast,
            min_agents: 1,
            agent_wait_timeout_ms: DEFAULT_AGENT_WAIT_MS,
            staleness_window_ms: duration_to_ms(DEFAULT_STALENESS_WINDOW),
            series_capacity: DEFAULT_SERIES_CAPACITY,
            tests: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub const fn options(&self, broker: &BrokerConfig) -> CoordinatorOptions {
        CoordinatorOptions {
            profile: self.dispatch_profile,
            abort_mode: self.abort_policy,
            series_capacity: self.series_capacity,
            staleness_window: Duration::from_millis(self.staleness_window_ms),
            broker: broker.options(),
        }
    }

    #[must_use]
    pub const fn agent_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_wait_timeout_ms)
    }

    /// Resolves every configured test into a runnable plan.
    ///
    /// # Errors
    ///
    /// Returns an error for the first invalid plan.
    pub fn plans(&self) -> AppResult<Vec<TestPlan>> {
        self.tests.iter().map(TestPlanConfig::plan).collect()
    }
}

fn all_phases() -> Vec<TestPhase> {
    TestPhase::ALL.to_vec()
}

const fn default_phase_timeout_ms() -> u64 {
    DEFAULT_PHASE_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestPlanConfig {
    pub id: String,
    #[serde(default = "all_phases")]
    pub phases: Vec<TestPhase>,
    #[serde(default)]
    pub workers: Vec<SimulatorAddress>,
    #[serde(default = "default_phase_timeout_ms")]
    pub phase_timeout_ms: u64,
    #[serde(default)]
    pub on_timeout: TimeoutAction,
}

impl TestPlanConfig {
    /// # Errors
    ///
    /// Returns an error when the plan lists no workers, lists a non-worker
    /// address, or has a zero phase timeout.
    pub fn plan(&self) -> AppResult<TestPlan> {
        if self.workers.is_empty() {
            return Err(AppError::config(ConfigError::EmptyWorkerList {
                test_id: self.id.clone(),
            }));
        }
        if let Some(address) = self
            .workers
            .iter()
            .find(|address| address.level() != AddressLevel::Worker || address.is_wildcard())
        {
            return Err(AppError::config(ConfigError::NotAWorker {
                test_id: self.id.clone(),
                address: address.to_string(),
            }));
        }
        if self.phase_timeout_ms == 0 {
            return Err(AppError::config(ConfigError::MustBePositive {
                field: "coordinator.tests.phase_timeout_ms",
            }));
        }
        let mut workers = self.workers.clone();
        workers.sort();
        workers.dedup();
        let plan = TestPlan {
            test_id: TestId::new(self.id.as_str()),
            phases: self.phases.clone(),
            workers,
            phase_timeout: Duration::from_millis(self.phase_timeout_ms),
            on_timeout: self.on_timeout,
        };
        if let Some(phase) = plan.misordered_phase() {
            return Err(AppError::config(ConfigError::PhaseOrder {
                test_id: self.id.clone(),
                phase: phase.as_str(),
            }));
        }
        Ok(plan)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub index: u32,
    pub listen: String,
    pub coordinator: String,
    pub min_workers: usize,
    pub worker_wait_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            index: 1,
            listen: DEFAULT_AGENT_LISTEN.to_owned(),
            coordinator: DEFAULT_COORDINATOR_LISTEN.to_owned(),
            min_workers: 0,
            worker_wait_timeout_ms: DEFAULT_WORKER_WAIT_MS,
        }
    }
}

impl AgentConfig {
    #[must_use]
    pub const fn worker_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_wait_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub agent_index: u32,
    pub index: u32,
    pub agent: String,
    pub performance_interval_ms: u64,
    /// How long the built-in idle workload spends in `RUN`.
    pub run_duration_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            agent_index: 1,
            index: 1,
            agent: DEFAULT_AGENT_LISTEN.to_owned(),
            performance_interval_ms: duration_to_ms(DEFAULT_PERFORMANCE_INTERVAL),
            run_duration_ms: DEFAULT_RUN_DURATION_MS,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub const fn options(&self, broker: &BrokerConfig) -> WorkerOptions {
        WorkerOptions {
            agent_index: self.agent_index,
            index: self.index,
            performance_interval: Duration::from_millis(self.performance_interval_ms),
            broker: broker.options(),
        }
    }

    #[must_use]
    pub const fn run_duration(&self) -> Duration {
        Duration::from_millis(self.run_duration_ms)
    }
}

fn ensure_positive(value: u64, field: &'static str) -> AppResult<()> {
    if value == 0 {
        return Err(AppError::config(ConfigError::MustBePositive { field }));
    }
    Ok(())
}

impl FleetConfig {
    /// Rejects zero values where a node would stall or refuse to start.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> AppResult<()> {
        ensure_positive(self.broker.request_timeout_ms, "broker.request_timeout_ms")?;
        ensure_positive(self.broker.hello_timeout_ms, "broker.hello_timeout_ms")?;
        ensure_positive(
            u64::try_from(self.broker.dispatch_pool_size).unwrap_or(u64::MAX),
            "broker.dispatch_pool_size",
        )?;
        ensure_positive(
            u64::try_from(self.coordinator.series_capacity).unwrap_or(u64::MAX),
            "coordinator.series_capacity",
        )?;
        ensure_positive(
            self.coordinator.staleness_window_ms,
            "coordinator.staleness_window_ms",
        )?;
        ensure_positive(u64::from(self.agent.index), "agent.index")?;
        ensure_positive(u64::from(self.worker.agent_index), "worker.agent_index")?;
        ensure_positive(u64::from(self.worker.index), "worker.index")?;
        ensure_positive(
            self.worker.performance_interval_ms,
            "worker.performance_interval_ms",
        )?;
        self.coordinator.plans()?;
        Ok(())
    }
}
