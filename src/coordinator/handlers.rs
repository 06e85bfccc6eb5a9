use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::broker::{Broker, ChildLossHook};
use crate::error::{AppError, AppResult, CoordinationError};
use crate::processor::{
    DispatchProfile, LocalExceptionLogger, NodeRole, OperationProcessor, mismatch,
};
use crate::protocol::{
    FailureOperation, FailureType, OperationType, ResponseType, SimulatorAddress,
    SimulatorOperation,
};

use super::failure::FailureContainer;
use super::histograms::TestHistogramContainer;
use super::performance::PerformanceStateContainer;
use super::phase::TestPhaseListenerContainer;

/// The four aggregation containers of a coordinator. Each owns its own
/// locking; nothing spans two of them.
#[derive(Clone, Default)]
pub struct CoordinatorState {
    pub failures: Arc<FailureContainer>,
    pub performance: Arc<PerformanceStateContainer>,
    pub histograms: Arc<TestHistogramContainer>,
    pub phases: Arc<TestPhaseListenerContainer>,
}

/// Builds the coordinator dispatch table for `profile`.
#[must_use]
pub fn coordinator_processor(
    profile: DispatchProfile,
    state: &CoordinatorState,
    exception_logger: Arc<LocalExceptionLogger>,
) -> OperationProcessor {
    let table = OperationProcessor::builder(NodeRole::Coordinator, exception_logger)
        .bind_exception_logging();
    match profile {
        DispatchProfile::Minimal => table.build(),
        DispatchProfile::Full => {
            let phases = Arc::clone(&state.phases);
            let performance = Arc::clone(&state.performance);
            let histograms = Arc::clone(&state.histograms);
            let failures = Arc::clone(&state.failures);
            let failure_phases = Arc::clone(&state.phases);
            table
                .bind(
                    OperationType::PhaseCompleted,
                    move |operation: &SimulatorOperation, source: &SimulatorAddress| -> AppResult<ResponseType> {
                        let SimulatorOperation::PhaseCompleted(completed) = operation else {
                            return Err(mismatch(OperationType::PhaseCompleted, operation));
                        };
                        match phases.mark_complete(&completed.test_id, completed.phase, source) {
                            Ok(_) => Ok(ResponseType::Success),
                            Err(err) => unknown_participant_response(err),
                        }
                    },
                )
                .bind(
                    OperationType::PerformanceState,
                    move |operation: &SimulatorOperation, source: &SimulatorAddress| -> AppResult<ResponseType> {
                        let SimulatorOperation::PerformanceState(report) = operation else {
                            return Err(mismatch(OperationType::PerformanceState, operation));
                        };
                        performance.update_all(source, report);
                        Ok(ResponseType::Success)
                    },
                )
                .bind(
                    OperationType::TestHistograms,
                    move |operation: &SimulatorOperation, source: &SimulatorAddress| -> AppResult<ResponseType> {
                        let SimulatorOperation::TestHistograms(report) = operation else {
                            return Err(mismatch(OperationType::TestHistograms, operation));
                        };
                        histograms.add_test_histograms(source, report)?;
                        Ok(ResponseType::Success)
                    },
                )
                .bind(
                    OperationType::Failure,
                    move |operation: &SimulatorOperation, _source: &SimulatorAddress| -> AppResult<ResponseType> {
                        let SimulatorOperation::Failure(failure) = operation else {
                            return Err(mismatch(OperationType::Failure, operation));
                        };
                        let worker = failure.worker_address;
                        let finished = failure.failure_type.is_worker_finished();
                        failures.add_failure(failure.clone());
                        if finished {
                            failure_phases.force_complete_member(&worker);
                        }
                        Ok(ResponseType::Success)
                    },
                )
                .build()
        }
    }
}

fn unknown_participant_response(err: AppError) -> AppResult<ResponseType> {
    if matches!(
        err.as_coordination(),
        Some(CoordinationError::UnknownParticipant { .. })
    ) {
        warn!("{}", err);
        return Ok(ResponseType::UnknownParticipant);
    }
    Err(err)
}

/// Unblocks barriers waiting on a lost child and records the loss.
pub struct CoordinatorLossHook {
    state: CoordinatorState,
}

impl CoordinatorLossHook {
    #[must_use]
    pub const fn new(state: CoordinatorState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ChildLossHook for CoordinatorLossHook {
    async fn on_child_lost(&self, _broker: &Broker, child: &SimulatorAddress, reason: &str) {
        self.state.phases.force_complete_member(child);
        self.state.failures.add_failure(FailureOperation::new(
            None,
            *child,
            FailureType::NodeLost,
            format!("connection lost: {}", reason),
        ));
    }
}
