//! Root node of the fleet: receives every report, aggregates it and drives
//! tests through their phases.
mod failure;
mod handlers;
mod histograms;
mod performance;
mod phase;
mod runner;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::broker::{Broker, BrokerOptions};
use crate::error::AppResult;
use crate::processor::{DispatchProfile, LocalExceptionLogger};
use crate::protocol::{
    ResponseType, SimulatorAddress, SimulatorOperation, TerminateWorkerOperation,
};

pub use failure::{
    AbortMode, AbortPolicy, FailFast, FailureAdded, FailureContainer, FailureRecord, Never,
};
pub use handlers::{CoordinatorLossHook, CoordinatorState, coordinator_processor};
pub use histograms::{HistogramSnapshot, ProbeSummary, TestHistogramContainer};
pub use performance::{
    DEFAULT_SERIES_CAPACITY, DEFAULT_STALENESS_WINDOW, FleetThroughput, PerformanceSample,
    PerformanceStateContainer, SampleOutcome,
};
pub use phase::{Completion, PhaseAwait, PhaseProgress, PhaseState, TestPhaseListenerContainer};
pub use runner::{PhaseOutcome, PhaseResult, TestPlan, TestRunReport, TimeoutAction, run_test};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub profile: DispatchProfile,
    pub abort_mode: AbortMode,
    pub series_capacity: usize,
    pub staleness_window: Duration,
    pub broker: BrokerOptions,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            profile: DispatchProfile::Full,
            abort_mode: AbortMode::FailFast,
            series_capacity: DEFAULT_SERIES_CAPACITY,
            staleness_window: DEFAULT_STALENESS_WINDOW,
            broker: BrokerOptions::default(),
        }
    }
}

pub struct Coordinator {
    broker: Broker,
    state: CoordinatorState,
}

impl Coordinator {
    #[must_use]
    pub fn new(options: CoordinatorOptions) -> Self {
        Self::with_policy(options, options.abort_mode.policy())
    }

    /// Builds a coordinator with a custom abort policy.
    #[must_use]
    pub fn with_policy(options: CoordinatorOptions, policy: Arc<dyn AbortPolicy>) -> Self {
        let state = CoordinatorState {
            failures: Arc::new(FailureContainer::new(policy)),
            performance: Arc::new(PerformanceStateContainer::new(
                options.series_capacity,
                options.staleness_window,
            )),
            histograms: Arc::new(TestHistogramContainer::new()),
            phases: Arc::new(TestPhaseListenerContainer::new()),
        };
        let processor = coordinator_processor(
            options.profile,
            &state,
            Arc::new(LocalExceptionLogger::new()),
        );
        let broker = Broker::new(SimulatorAddress::root(), Arc::new(processor), options.broker);
        broker.add_child_loss_hook(Arc::new(CoordinatorLossHook::new(state.clone())));
        Self { broker, state }
    }

    /// # Errors
    ///
    /// Returns an error when `bind_addr` cannot be bound.
    pub async fn listen(&self, bind_addr: &str) -> AppResult<SocketAddr> {
        self.broker.listen(bind_addr).await
    }

    #[must_use]
    pub const fn broker(&self) -> &Broker {
        &self.broker
    }

    #[must_use]
    pub const fn state(&self) -> &CoordinatorState {
        &self.state
    }

    /// Gates a run on fleet size.
    ///
    /// # Errors
    ///
    /// Returns an error when fewer than `min_agents` agents join within `wait`.
    pub async fn wait_for_agents(&self, min_agents: usize, wait: Duration) -> AppResult<()> {
        self.broker.wait_for_children(min_agents, wait).await?;
        info!("{} agent(s) connected", self.broker.children().len());
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error when a barrier cannot be registered for the plan.
    pub async fn run_test(&self, plan: &TestPlan) -> AppResult<TestRunReport> {
        run_test(&self.broker, &self.state, plan).await
    }

    /// Asks every worker of the fleet to exit.
    pub async fn terminate_workers(&self, reason: &str) -> ResponseType {
        let terminate = SimulatorOperation::TerminateWorker(TerminateWorkerOperation {
            reason: Some(reason.to_owned()),
        });
        self.broker
            .send(&SimulatorAddress::all_workers(), &terminate)
            .await
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
    }
}
