use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use crate::error::{AppResult, WorkloadError};
use crate::protocol::{CustomOperation, ResponseType, TestPhase};
use crate::utils::duration_to_micros;

use super::context::WorkerContext;

/// Benchmark logic plugged into a worker.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Runs one phase to completion.
    ///
    /// # Errors
    ///
    /// A returned error is reported as a `WORKER_EXCEPTION` failure; the
    /// phase still counts as completed for this worker.
    async fn run_phase(&self, phase: TestPhase, context: &WorkerContext)
    -> Result<(), WorkloadError>;

    /// Handles a workload-control message.
    ///
    /// # Errors
    ///
    /// Errors are contained by the dispatcher.
    fn on_custom(&self, _operation: &CustomOperation) -> AppResult<ResponseType> {
        Ok(ResponseType::UnsupportedOperationOnThisProcessor)
    }
}

pub const IDLE_PROBE: &str = "idle";
const DEFAULT_MAX_PAUSE: Duration = Duration::from_millis(5);

/// Sleeps through `RUN` in short random pauses, counting each as an
/// operation. Every other phase returns at once.
#[derive(Debug, Clone, Copy)]
pub struct IdleWorkload {
    run_duration: Duration,
    max_pause: Duration,
}

impl IdleWorkload {
    #[must_use]
    pub const fn new(run_duration: Duration) -> Self {
        Self {
            run_duration,
            max_pause: DEFAULT_MAX_PAUSE,
        }
    }

    #[must_use]
    pub const fn with_max_pause(mut self, max_pause: Duration) -> Self {
        self.max_pause = max_pause;
        self
    }
}

#[async_trait]
impl Workload for IdleWorkload {
    async fn run_phase(
        &self,
        phase: TestPhase,
        context: &WorkerContext,
    ) -> Result<(), WorkloadError> {
        if phase != TestPhase::Run {
            return Ok(());
        }
        let max_micros = duration_to_micros(self.max_pause).max(1);
        let started = Instant::now();
        while started.elapsed() < self.run_duration {
            let pause = Duration::from_micros(rand::thread_rng().gen_range(1..=max_micros));
            let operation_started = Instant::now();
            tokio::time::sleep(pause).await;
            context.record_operations(1);
            context
                .record_latency(IDLE_PROBE, operation_started.elapsed())
                .map_err(|err| WorkloadError::failed(err.to_string()))?;
        }
        Ok(())
    }

    fn on_custom(&self, operation: &CustomOperation) -> AppResult<ResponseType> {
        if operation.name == "ping" {
            return Ok(ResponseType::Success);
        }
        Ok(ResponseType::UnsupportedOperationOnThisProcessor)
    }
}
