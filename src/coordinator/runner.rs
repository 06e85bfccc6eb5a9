use std::time::Duration;

use futures_util::future::join_all;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::error::{AppError, AppResult, CoordinationError};
use crate::protocol::{
    FailureOperation, FailureType, ResponseType, SimulatorAddress, SimulatorOperation,
    StartTestPhaseOperation, StopTestOperation, TestId, TestPhase,
};

use super::failure::FailureRecord;
use super::handlers::CoordinatorState;
use super::histograms::ProbeSummary;
use super::performance::FleetThroughput;
use super::phase::{PhaseAwait, PhaseProgress};

/// What to do when a phase barrier is not reached in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Abort,
    Proceed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPlan {
    pub test_id: TestId,
    pub phases: Vec<TestPhase>,
    pub workers: Vec<SimulatorAddress>,
    pub phase_timeout: Duration,
    pub on_timeout: TimeoutAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Complete,
    /// Timed out and the plan chose to continue.
    Proceeded,
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResult {
    pub phase: TestPhase,
    pub outcome: PhaseOutcome,
    pub progress: PhaseProgress,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestRunReport {
    pub test_id: TestId,
    pub phases: Vec<PhaseResult>,
    pub aborted: bool,
    /// Failures of this test plus fleet-level ones such as lost nodes.
    pub failures: Vec<FailureRecord>,
    pub throughput: FleetThroughput,
    pub probes: Vec<ProbeSummary>,
}

impl TestRunReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.aborted
            && self
                .failures
                .iter()
                .all(|record| !record.failure.failure_type.is_poison())
            && self
                .phases
                .iter()
                .all(|result| result.outcome == PhaseOutcome::Complete)
    }
}

async fn abort_raised(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl TestPlan {
    /// Returns the first phase that repeats or runs backwards.
    #[must_use]
    pub fn misordered_phase(&self) -> Option<TestPhase> {
        self.phases
            .iter()
            .zip(self.phases.iter().skip(1))
            .find(|(previous, next)| previous >= next)
            .map(|(_, next)| *next)
    }
}

/// Drives `plan` through its phases on `broker`. The test's barriers are
/// removed on every exit, and workers are told to stop whenever the run
/// does not reach its last phase.
///
/// # Errors
///
/// Returns an error when the phases are not in lifecycle order or a
/// barrier cannot be registered for the plan.
pub async fn run_test(
    broker: &Broker,
    state: &CoordinatorState,
    plan: &TestPlan,
) -> AppResult<TestRunReport> {
    let test_id = &plan.test_id;
    if let Some(phase) = plan.misordered_phase() {
        return Err(AppError::coordination(CoordinationError::PhaseOutOfOrder {
            test_id: test_id.to_string(),
            phase: phase.as_str(),
        }));
    }
    info!(
        "Starting test {} on {} worker(s)",
        test_id,
        plan.workers.len()
    );

    let driven = drive_phases(broker, state, plan).await;
    if !matches!(driven, Ok((_, false))) {
        let stop = SimulatorOperation::StopTest(StopTestOperation {
            test_id: test_id.clone(),
        });
        let response = broker.send(&SimulatorAddress::all_workers(), &stop).await;
        info!("Stopped test {} on all workers: {}", test_id, response);
    }
    state.phases.remove_test(test_id);
    let (phases, aborted) = driven?;

    Ok(TestRunReport {
        test_id: test_id.clone(),
        phases,
        aborted,
        failures: state
            .failures
            .list()
            .into_iter()
            .filter(|record| {
                record
                    .failure
                    .test_id
                    .as_ref()
                    .is_none_or(|failed_test| failed_test == test_id)
            })
            .collect(),
        throughput: state.performance.aggregate(test_id),
        probes: state.histograms.summary(test_id),
    })
}

async fn drive_phases(
    broker: &Broker,
    state: &CoordinatorState,
    plan: &TestPlan,
) -> AppResult<(Vec<PhaseResult>, bool)> {
    let test_id = &plan.test_id;
    let mut abort_signal = state.failures.abort_signal();
    let mut phases: Vec<PhaseResult> = Vec::with_capacity(plan.phases.len());

    for phase in &plan.phases {
        let phase = *phase;
        if state.failures.is_abort_requested() {
            return Ok((phases, true));
        }
        state
            .phases
            .register_expected(test_id, phase, plan.workers.iter().copied())?;
        start_phase(broker, state, test_id, phase, &plan.workers).await;

        let waited = tokio::select! {
            waited = state.phases.await_phase(test_id, phase, plan.phase_timeout) => waited?,
            () = abort_raised(&mut abort_signal) => {
                state.phases.cancel_test(test_id);
                state
                    .phases
                    .await_phase(test_id, phase, Duration::ZERO)
                    .await?
            }
        };

        let (outcome, progress) = match waited {
            PhaseAwait::Complete(progress) => (PhaseOutcome::Complete, progress),
            PhaseAwait::Cancelled(progress) => (PhaseOutcome::Aborted, progress),
            PhaseAwait::TimedOut(progress) => match plan.on_timeout {
                TimeoutAction::Proceed => {
                    warn!(
                        "Phase {} of {} timed out waiting for {:?}; proceeding",
                        phase,
                        test_id,
                        progress.pending()
                    );
                    (PhaseOutcome::Proceeded, progress)
                }
                TimeoutAction::Abort => {
                    error!(
                        "Phase {} of {} timed out waiting for {:?}; aborting",
                        phase,
                        test_id,
                        progress.pending()
                    );
                    (PhaseOutcome::TimedOut, progress)
                }
            },
        };
        info!("Phase {} of {} finished: {:?}", phase, test_id, outcome);
        phases.push(PhaseResult {
            phase,
            outcome,
            progress,
        });
        if matches!(outcome, PhaseOutcome::Aborted | PhaseOutcome::TimedOut) {
            return Ok((phases, true));
        }
    }
    Ok((phases, false))
}

async fn start_phase(
    broker: &Broker,
    state: &CoordinatorState,
    test_id: &TestId,
    phase: TestPhase,
    workers: &[SimulatorAddress],
) {
    let operation = SimulatorOperation::StartTestPhase(StartTestPhaseOperation {
        test_id: test_id.clone(),
        phase,
    });
    let sends = workers.iter().map(|worker| {
        let operation = &operation;
        async move { (*worker, broker.send(worker, operation).await) }
    });
    for (worker, response) in join_all(sends).await {
        match response {
            ResponseType::Success => {}
            ResponseType::NodeUnreachable => {
                state.phases.force_complete_member(&worker);
                state.failures.add_failure(FailureOperation::new(
                    Some(test_id.clone()),
                    worker,
                    FailureType::NodeLost,
                    format!("unreachable when starting {}", phase),
                ));
            }
            ResponseType::UnsupportedOperationOnThisProcessor
            | ResponseType::ExceptionDuringOperationExecution
            | ResponseType::UnknownParticipant => {
                warn!(
                    "Worker {} answered {} to start {} of {}",
                    worker, response, phase, test_id
                );
                state.failures.add_failure(FailureOperation::new(
                    Some(test_id.clone()),
                    worker,
                    FailureType::WorkerException,
                    format!("refused to start {}: {}", phase, response),
                ));
                // It will never report this phase.
                if let Err(err) = state.phases.force_complete(test_id, phase, &worker) {
                    warn!("Could not release {} from {}/{}: {}", worker, test_id, phase, err);
                }
            }
        }
    }
}
