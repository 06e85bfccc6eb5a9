//! Leaf node of the fleet: runs workload phases on command and streams
//! performance, latency and failure reports to the coordinator.
mod context;
mod workload;


use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerOptions};
use crate::error::{AppError, AppResult, WorkloadError};
use crate::processor::{LocalExceptionLogger, NodeRole, OperationProcessor, mismatch};
use crate::protocol::{
    FailureType, OperationType, PerformanceState, PerformanceStateOperation, ResponseType,
    SimulatorAddress, SimulatorOperation, StartTestPhaseOperation, TestId, TestPhase,
};

pub use context::WorkerContext;
pub use workload::{IDLE_PROBE, IdleWorkload, Workload};

pub const DEFAULT_PERFORMANCE_INTERVAL: Duration = Duration::from_secs(1);
/// Time granted to answer TERMINATE_WORKER before the links are dropped.
const TERMINATE_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub agent_index: u32,
    pub index: u32,
    pub performance_interval: Duration,
    pub broker: BrokerOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            agent_index: 1,
            index: 1,
            performance_interval: DEFAULT_PERFORMANCE_INTERVAL,
            broker: BrokerOptions::default(),
        }
    }
}

/// A phase task. `done` flips once the workload has returned and its
/// reports are flushed, before PHASE_COMPLETED goes out.
struct RunningPhase {
    phase: TestPhase,
    handle: JoinHandle<()>,
    done: Arc<AtomicBool>,
}

impl RunningPhase {
    fn is_active(&self) -> bool {
        !self.done.load(Ordering::Acquire) && !self.handle.is_finished()
    }
}

struct TestRun {
    context: WorkerContext,
    phase: Option<RunningPhase>,
}

struct WorkerShared {
    address: SimulatorAddress,
    workload: Arc<dyn Workload>,
    runtime: Handle,
    broker: OnceLock<Broker>,
    tests: DashMap<TestId, TestRun>,
    reporter: Mutex<Option<JoinHandle<()>>>,
    terminated: watch::Sender<bool>,
}

fn lock_reporter(reporter: &Mutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    match reporter.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl WorkerShared {
    fn start_phase(&self, start: &StartTestPhaseOperation) -> AppResult<ResponseType> {
        if *self.terminated.borrow() {
            return Err(AppError::workload(WorkloadError::ShuttingDown));
        }
        let Some(broker) = self.broker.get() else {
            return Err(AppError::workload(WorkloadError::ShuttingDown));
        };
        let mut run = self
            .tests
            .entry(start.test_id.clone())
            .or_insert_with(|| TestRun {
                context: WorkerContext::new(self.address, start.test_id.clone(), broker.clone()),
                phase: None,
            });
        if let Some(running) = run.phase.as_ref().filter(|running| running.is_active()) {
            return Err(AppError::workload(WorkloadError::PhaseAlreadyRunning {
                test_id: start.test_id.to_string(),
                phase: running.phase.as_str(),
            }));
        }
        let done = Arc::new(AtomicBool::new(false));
        let handle = self.runtime.spawn(run_phase(
            Arc::clone(&self.workload),
            run.context.clone(),
            start.phase,
            Arc::clone(&done),
        ));
        run.phase = Some(RunningPhase {
            phase: start.phase,
            handle,
            done,
        });
        info!("{} started {} of {}", self.address, start.phase, start.test_id);
        Ok(ResponseType::Success)
    }

    fn stop_test(&self, test_id: &TestId) {
        if let Some((_, run)) = self.tests.remove(test_id) {
            if let Some(running) = run.phase {
                running.handle.abort();
                info!("{} stopped {} of {}", self.address, running.phase, test_id);
            }
        } else {
            debug!("{} has no running test {}", self.address, test_id);
        }
    }

    fn stop_all(&self) {
        for entry in self.tests.iter() {
            if let Some(running) = &entry.value().phase {
                running.handle.abort();
            }
        }
        self.tests.clear();
        if let Some(reporter) = lock_reporter(&self.reporter).take() {
            reporter.abort();
        }
    }

    fn contexts(&self) -> Vec<WorkerContext> {
        self.tests
            .iter()
            .map(|entry| entry.value().context.clone())
            .collect()
    }

    async fn report_interval(&self) {
        let contexts = self.contexts();
        let Some(broker) = self.broker.get() else {
            return;
        };
        if contexts.is_empty() {
            return;
        }
        let states: BTreeMap<TestId, PerformanceState> = contexts
            .iter()
            .map(|context| (context.test_id().clone(), context.performance_state()))
            .collect();
        let report = SimulatorOperation::PerformanceState(PerformanceStateOperation { states });
        let response = broker.send(&SimulatorAddress::root(), &report).await;
        if !response.is_success() {
            debug!("{} performance report answered {}", self.address, response);
        }
        for context in contexts {
            if let Err(err) = context.report_histograms().await {
                warn!(
                    "{} histogram report for {} failed: {}",
                    self.address,
                    context.test_id(),
                    err
                );
            }
        }
    }
}

async fn run_phase(
    workload: Arc<dyn Workload>,
    context: WorkerContext,
    phase: TestPhase,
    done: Arc<AtomicBool>,
) {
    let outcome = AssertUnwindSafe(workload.run_phase(phase, &context))
        .catch_unwind()
        .await;
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(_panic) => Some(format!("workload panicked during {}", phase)),
    };
    if let Some(message) = failure {
        error!(
            "{} failed {} of {}: {}",
            context.address(),
            phase,
            context.test_id(),
            message
        );
        let response = context
            .report_failure(FailureType::WorkerException, message)
            .await;
        if !response.is_success() {
            warn!("Failure report from {} answered {}", context.address(), response);
        }
    }
    context.flush().await;
    // The coordinator may start the next phase as soon as it sees the
    // completion, before this request gets its answer.
    done.store(true, Ordering::Release);
    let response = context.report_phase_completed(phase).await;
    if !response.is_success() {
        warn!(
            "{} completion of {} for {} answered {}",
            context.address(),
            phase,
            context.test_id(),
            response
        );
    }
}

async fn report_periodically(shared: Arc<WorkerShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        shared.report_interval().await;
    }
}

async fn terminated(receiver: &mut watch::Receiver<bool>) -> bool {
    receiver.wait_for(|terminated| *terminated).await.is_ok()
}

fn worker_processor(shared: &Arc<WorkerShared>) -> OperationProcessor {
    let start_shared = Arc::clone(shared);
    let stop_shared = Arc::clone(shared);
    let terminate_shared = Arc::clone(shared);
    let custom_shared = Arc::clone(shared);
    OperationProcessor::builder(NodeRole::Worker, Arc::new(LocalExceptionLogger::new()))
        .bind(
            OperationType::StartTestPhase,
            move |operation: &SimulatorOperation, _source: &SimulatorAddress| -> AppResult<ResponseType> {
                let SimulatorOperation::StartTestPhase(start) = operation else {
                    return Err(mismatch(OperationType::StartTestPhase, operation));
                };
                start_shared.start_phase(start)
            },
        )
        .bind(
            OperationType::StopTest,
            move |operation: &SimulatorOperation, _source: &SimulatorAddress| -> AppResult<ResponseType> {
                let SimulatorOperation::StopTest(stop) = operation else {
                    return Err(mismatch(OperationType::StopTest, operation));
                };
                stop_shared.stop_test(&stop.test_id);
                Ok(ResponseType::Success)
            },
        )
        .bind(
            OperationType::TerminateWorker,
            move |operation: &SimulatorOperation, _source: &SimulatorAddress| -> AppResult<ResponseType> {
                let SimulatorOperation::TerminateWorker(terminate) = operation else {
                    return Err(mismatch(OperationType::TerminateWorker, operation));
                };
                info!(
                    "{} terminating: {}",
                    terminate_shared.address,
                    terminate.reason.as_deref().unwrap_or("requested")
                );
                terminate_shared.terminated.send_replace(true);
                Ok(ResponseType::Success)
            },
        )
        .bind(
            OperationType::Custom,
            move |operation: &SimulatorOperation, _source: &SimulatorAddress| -> AppResult<ResponseType> {
                let SimulatorOperation::Custom(custom) = operation else {
                    return Err(mismatch(OperationType::Custom, operation));
                };
                custom_shared.workload.on_custom(custom)
            },
        )
        .build()
}

pub struct Worker {
    broker: Broker,
    shared: Arc<WorkerShared>,
    performance_interval: Duration,
}

impl Worker {
    /// Builds a worker on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when an index is zero or no runtime is running.
    pub fn new(options: WorkerOptions, workload: Arc<dyn Workload>) -> AppResult<Self> {
        let address = SimulatorAddress::worker(options.agent_index, options.index)?;
        let runtime = Handle::try_current().map_err(|err| {
            AppError::workload(WorkloadError::failed(format!(
                "worker needs a tokio runtime: {}",
                err
            )))
        })?;
        let (terminated, _) = watch::channel(false);
        let shared = Arc::new(WorkerShared {
            address,
            workload,
            runtime,
            broker: OnceLock::new(),
            tests: DashMap::new(),
            reporter: Mutex::new(None),
            terminated,
        });
        let broker = Broker::new(address, Arc::new(worker_processor(&shared)), options.broker);
        if shared.broker.set(broker.clone()).is_err() {
            debug!("{} broker was already attached", address);
        }
        Ok(Self {
            broker,
            shared,
            performance_interval: options.performance_interval,
        })
    }

    #[must_use]
    pub fn address(&self) -> SimulatorAddress {
        self.shared.address
    }

    #[must_use]
    pub const fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Joins the agent at `agent_addr` and starts periodic reporting.
    ///
    /// # Errors
    ///
    /// Returns an error when the agent cannot be reached or rejects this
    /// worker.
    pub async fn connect(&self, agent_addr: &str) -> AppResult<()> {
        self.broker.connect_parent(agent_addr).await?;
        let reporter = self.shared.runtime.spawn(report_periodically(
            Arc::clone(&self.shared),
            self.performance_interval,
        ));
        if let Some(previous) = lock_reporter(&self.shared.reporter).replace(reporter) {
            previous.abort();
        }
        Ok(())
    }

    /// Serves until terminated or orphaned, then shuts down.
    pub async fn run(&self) {
        let mut receiver = self.shared.terminated.subscribe();
        tokio::select! {
            () = self.broker.parent_closed() => {
                info!("{} lost its agent", self.address());
            }
            stopped = terminated(&mut receiver) => {
                if stopped {
                    tokio::time::sleep(TERMINATE_GRACE).await;
                }
            }
        }
        self.shutdown();
    }

    /// Aborts running phases and drops every link.
    pub fn shutdown(&self) {
        self.shared.stop_all();
        self.shared.terminated.send_replace(true);
        self.broker.shutdown();
    }
}
