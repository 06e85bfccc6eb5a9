use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult, ProtocolError};

use super::address::SimulatorAddress;

/// Identifier of a test running across the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    pub fn new<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle stages every worker of a test passes through together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestPhase {
    Setup,
    LocalPrepare,
    GlobalPrepare,
    Warmup,
    LocalAfterWarmup,
    GlobalAfterWarmup,
    Run,
    GlobalVerify,
    LocalVerify,
    GlobalTeardown,
    LocalTeardown,
}

impl TestPhase {
    pub const ALL: [TestPhase; 11] = [
        TestPhase::Setup,
        TestPhase::LocalPrepare,
        TestPhase::GlobalPrepare,
        TestPhase::Warmup,
        TestPhase::LocalAfterWarmup,
        TestPhase::GlobalAfterWarmup,
        TestPhase::Run,
        TestPhase::GlobalVerify,
        TestPhase::LocalVerify,
        TestPhase::GlobalTeardown,
        TestPhase::LocalTeardown,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TestPhase::Setup => "SETUP",
            TestPhase::LocalPrepare => "LOCAL_PREPARE",
            TestPhase::GlobalPrepare => "GLOBAL_PREPARE",
            TestPhase::Warmup => "WARMUP",
            TestPhase::LocalAfterWarmup => "LOCAL_AFTER_WARMUP",
            TestPhase::GlobalAfterWarmup => "GLOBAL_AFTER_WARMUP",
            TestPhase::Run => "RUN",
            TestPhase::GlobalVerify => "GLOBAL_VERIFY",
            TestPhase::LocalVerify => "LOCAL_VERIFY",
            TestPhase::GlobalTeardown => "GLOBAL_TEARDOWN",
            TestPhase::LocalTeardown => "LOCAL_TEARDOWN",
        }
    }

    /// Global phases run on a single worker of the test; local ones on all.
    #[must_use]
    pub const fn is_global(self) -> bool {
        matches!(
            self,
            TestPhase::GlobalPrepare
                | TestPhase::GlobalAfterWarmup
                | TestPhase::GlobalVerify
                | TestPhase::GlobalTeardown
        )
    }

    #[must_use]
    pub fn next(self) -> Option<Self> {
        let position = Self::ALL.iter().position(|phase| *phase == self)?;
        Self::ALL.get(position.saturating_add(1)).copied()
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of every operation kind understood on the wire.
///
/// Tags are explicit strings so new kinds never shift existing encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationType {
    Exception,
    PhaseCompleted,
    PerformanceState,
    TestHistograms,
    Failure,
    StartTestPhase,
    StopTest,
    TerminateWorker,
    Custom,
}

impl OperationType {
    pub const ALL: [OperationType; 9] = [
        OperationType::Exception,
        OperationType::PhaseCompleted,
        OperationType::PerformanceState,
        OperationType::TestHistograms,
        OperationType::Failure,
        OperationType::StartTestPhase,
        OperationType::StopTest,
        OperationType::TerminateWorker,
        OperationType::Custom,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationType::Exception => "EXCEPTION",
            OperationType::PhaseCompleted => "PHASE_COMPLETED",
            OperationType::PerformanceState => "PERFORMANCE_STATE",
            OperationType::TestHistograms => "TEST_HISTOGRAMS",
            OperationType::Failure => "FAILURE",
            OperationType::StartTestPhase => "START_TEST_PHASE",
            OperationType::StopTest => "STOP_TEST",
            OperationType::TerminateWorker => "TERMINATE_WORKER",
            OperationType::Custom => "CUSTOM",
        }
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|operation_type| operation_type.as_str() == tag)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    WorkerException,
    WorkerTimeout,
    WorkerOom,
    WorkerAbnormalExit,
    WorkerNormalExit,
    NodeLost,
}

impl FailureType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FailureType::WorkerException => "WORKER_EXCEPTION",
            FailureType::WorkerTimeout => "WORKER_TIMEOUT",
            FailureType::WorkerOom => "WORKER_OOM",
            FailureType::WorkerAbnormalExit => "WORKER_ABNORMAL_EXIT",
            FailureType::WorkerNormalExit => "WORKER_NORMAL_EXIT",
            FailureType::NodeLost => "NODE_LOST",
        }
    }

    /// The reporting worker will not take part in any further phase.
    #[must_use]
    pub const fn is_worker_finished(self) -> bool {
        matches!(
            self,
            FailureType::WorkerOom
                | FailureType::WorkerAbnormalExit
                | FailureType::WorkerNormalExit
                | FailureType::NodeLost
        )
    }

    /// Every type except a normal exit counts against the run.
    #[must_use]
    pub const fn is_poison(self) -> bool {
        !matches!(self, FailureType::WorkerNormalExit)
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionOperation {
    pub kind: String,
    #[serde(default)]
    pub test_id: Option<TestId>,
    pub message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCompletedOperation {
    pub test_id: TestId,
    pub phase: TestPhase,
}

/// Monotonic operation counter sample of one worker for one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceState {
    pub operation_count: u64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceStateOperation {
    pub states: BTreeMap<TestId, PerformanceState>,
}

/// Interval latency histograms of one worker, keyed by probe name and
/// encoded as base64 HDR V2 payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestHistogramOperation {
    pub test_id: TestId,
    pub probe_histograms: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureOperation {
    #[serde(default)]
    pub test_id: Option<TestId>,
    pub worker_address: SimulatorAddress,
    pub failure_type: FailureType,
    pub message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    pub timestamp_ms: i64,
}

impl FailureOperation {
    pub fn new<M>(
        test_id: Option<TestId>,
        worker_address: SimulatorAddress,
        failure_type: FailureType,
        message: M,
    ) -> Self
    where
        M: Into<String>,
    {
        Self {
            test_id,
            worker_address,
            failure_type,
            message: message.into(),
            stack_trace: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: String) -> Self {
        self.stack_trace = Some(stack_trace);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTestPhaseOperation {
    pub test_id: TestId,
    pub phase: TestPhase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTestOperation {
    pub test_id: TestId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateWorkerOperation {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Workload-specific control message forwarded without interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomOperation {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimulatorOperation {
    Exception(ExceptionOperation),
    PhaseCompleted(PhaseCompletedOperation),
    PerformanceState(PerformanceStateOperation),
    TestHistograms(TestHistogramOperation),
    Failure(FailureOperation),
    StartTestPhase(StartTestPhaseOperation),
    StopTest(StopTestOperation),
    TerminateWorker(TerminateWorkerOperation),
    Custom(CustomOperation),
}

impl SimulatorOperation {
    #[must_use]
    pub const fn operation_type(&self) -> OperationType {
        match self {
            SimulatorOperation::Exception(_) => OperationType::Exception,
            SimulatorOperation::PhaseCompleted(_) => OperationType::PhaseCompleted,
            SimulatorOperation::PerformanceState(_) => OperationType::PerformanceState,
            SimulatorOperation::TestHistograms(_) => OperationType::TestHistograms,
            SimulatorOperation::Failure(_) => OperationType::Failure,
            SimulatorOperation::StartTestPhase(_) => OperationType::StartTestPhase,
            SimulatorOperation::StopTest(_) => OperationType::StopTest,
            SimulatorOperation::TerminateWorker(_) => OperationType::TerminateWorker,
            SimulatorOperation::Custom(_) => OperationType::Custom,
        }
    }

    /// Encodes the operation into its tagged wire form.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload cannot be serialized.
    pub fn encode(&self) -> AppResult<WireOperation> {
        let payload = match self {
            SimulatorOperation::Exception(op) => serde_json::to_value(op),
            SimulatorOperation::PhaseCompleted(op) => serde_json::to_value(op),
            SimulatorOperation::PerformanceState(op) => serde_json::to_value(op),
            SimulatorOperation::TestHistograms(op) => serde_json::to_value(op),
            SimulatorOperation::Failure(op) => serde_json::to_value(op),
            SimulatorOperation::StartTestPhase(op) => serde_json::to_value(op),
            SimulatorOperation::StopTest(op) => serde_json::to_value(op),
            SimulatorOperation::TerminateWorker(op) => serde_json::to_value(op),
            SimulatorOperation::Custom(op) => serde_json::to_value(op),
        }
        .map_err(|err| {
            AppError::protocol(ProtocolError::Serialize {
                context: "operation payload",
                source: err,
            })
        })?;
        Ok(WireOperation {
            kind: self.operation_type().as_str().to_owned(),
            payload,
        })
    }

    /// Decodes a tagged wire operation.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownOperationType`] for an unrecognised tag
    /// and [`ProtocolError::Payload`] when the payload does not match the tag.
    pub fn decode(wire: &WireOperation) -> AppResult<Self> {
        let operation_type = wire.operation_type()?;
        let payload = wire.payload.clone();
        let decoded = match operation_type {
            OperationType::Exception => serde_json::from_value(payload).map(Self::Exception),
            OperationType::PhaseCompleted => {
                serde_json::from_value(payload).map(Self::PhaseCompleted)
            }
            OperationType::PerformanceState => {
                serde_json::from_value(payload).map(Self::PerformanceState)
            }
            OperationType::TestHistograms => {
                serde_json::from_value(payload).map(Self::TestHistograms)
            }
            OperationType::Failure => serde_json::from_value(payload).map(Self::Failure),
            OperationType::StartTestPhase => {
                serde_json::from_value(payload).map(Self::StartTestPhase)
            }
            OperationType::StopTest => serde_json::from_value(payload).map(Self::StopTest),
            OperationType::TerminateWorker => {
                serde_json::from_value(payload).map(Self::TerminateWorker)
            }
            OperationType::Custom => serde_json::from_value(payload).map(Self::Custom),
        };
        decoded.map_err(|err| {
            AppError::protocol(ProtocolError::Payload {
                operation: operation_type.as_str(),
                source: err,
            })
        })
    }
}

/// Tagged operation as carried inside a request frame.
///
/// Intermediate brokers forward this form untouched; only the node that
/// dispatches the operation decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOperation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl WireOperation {
    /// Resolves the tag against the known operation set.
    ///
    /// # Errors
    ///
    /// Returns an error when the tag is not a known operation type.
    pub fn operation_type(&self) -> AppResult<OperationType> {
        OperationType::from_tag(&self.kind).ok_or_else(|| {
            AppError::protocol(ProtocolError::UnknownOperationType {
                tag: self.kind.clone(),
            })
        })
    }
}
