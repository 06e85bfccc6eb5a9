use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::AppResult;
use crate::metrics::LatencyHistogram;
use crate::protocol::{
    FailureOperation, FailureType, PerformanceState, PerformanceStateOperation,
    PhaseCompletedOperation, ResponseType, SimulatorAddress, SimulatorOperation,
    TestHistogramOperation, TestId, TestPhase,
};
use crate::utils::{current_time_ms, duration_to_micros};

struct ContextInner {
    address: SimulatorAddress,
    test_id: TestId,
    broker: Broker,
    operations: AtomicU64,
    probes: Mutex<BTreeMap<String, LatencyHistogram>>,
}

/// Handle a workload uses to count work, time it and report upwards.
///
/// One context exists per test on a worker; it outlives individual phases so
/// counters and probes accumulate across them.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<ContextInner>,
}

fn lock_probes(
    probes: &Mutex<BTreeMap<String, LatencyHistogram>>,
) -> MutexGuard<'_, BTreeMap<String, LatencyHistogram>> {
    match probes.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl WorkerContext {
    pub(crate) fn new(address: SimulatorAddress, test_id: TestId, broker: Broker) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                address,
                test_id,
                broker,
                operations: AtomicU64::new(0),
                probes: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn address(&self) -> SimulatorAddress {
        self.inner.address
    }

    #[must_use]
    pub fn test_id(&self) -> &TestId {
        &self.inner.test_id
    }

    pub fn record_operations(&self, count: u64) {
        self.inner.operations.fetch_add(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn operation_count(&self) -> u64 {
        self.inner.operations.load(Ordering::Relaxed)
    }

    /// Records `latency` in microseconds on the named probe.
    ///
    /// # Errors
    ///
    /// Returns an error when the probe histogram rejects the value.
    pub fn record_latency(&self, probe: &str, latency: Duration) -> AppResult<()> {
        let micros = duration_to_micros(latency);
        let mut probes = lock_probes(&self.inner.probes);
        if let Some(histogram) = probes.get_mut(probe) {
            return histogram.record(micros);
        }
        let mut histogram = LatencyHistogram::new()?;
        histogram.record(micros)?;
        probes.insert(probe.to_owned(), histogram);
        Ok(())
    }

    #[must_use]
    pub fn performance_state(&self) -> PerformanceState {
        PerformanceState {
            operation_count: self.operation_count(),
            timestamp_ms: current_time_ms(),
        }
    }

    pub async fn report_failure<M>(&self, failure_type: FailureType, message: M) -> ResponseType
    where
        M: Into<String>,
    {
        let failure = FailureOperation::new(
            Some(self.inner.test_id.clone()),
            self.inner.address,
            failure_type,
            message,
        );
        self.send(SimulatorOperation::Failure(failure)).await
    }

    pub async fn report_performance(&self) -> ResponseType {
        let mut states = BTreeMap::new();
        states.insert(self.inner.test_id.clone(), self.performance_state());
        self.send(SimulatorOperation::PerformanceState(PerformanceStateOperation {
            states,
        }))
        .await
    }

    /// Ships every non-empty probe recorded since the last call and resets it.
    ///
    /// # Errors
    ///
    /// Returns an error when a probe cannot be encoded; the probes are reset
    /// either way.
    pub async fn report_histograms(&self) -> AppResult<ResponseType> {
        let interval: Vec<(String, LatencyHistogram)> = {
            let mut probes = lock_probes(&self.inner.probes);
            let taken = probes
                .iter()
                .filter(|(_, histogram)| !histogram.is_empty())
                .map(|(name, histogram)| (name.clone(), histogram.clone()))
                .collect();
            for histogram in probes.values_mut() {
                histogram.reset();
            }
            taken
        };
        if interval.is_empty() {
            return Ok(ResponseType::Success);
        }
        let mut probe_histograms = BTreeMap::new();
        for (name, histogram) in interval {
            probe_histograms.insert(name, histogram.encode_base64()?);
        }
        Ok(self
            .send(SimulatorOperation::TestHistograms(TestHistogramOperation {
                test_id: self.inner.test_id.clone(),
                probe_histograms,
            }))
            .await)
    }

    pub async fn report_phase_completed(&self, phase: TestPhase) -> ResponseType {
        self.send(SimulatorOperation::PhaseCompleted(PhaseCompletedOperation {
            test_id: self.inner.test_id.clone(),
            phase,
        }))
        .await
    }

    /// Sends the final performance state and pending histograms.
    pub(crate) async fn flush(&self) {
        let response = self.report_performance().await;
        if !response.is_success() {
            debug!(
                "Final performance report for {} answered {}",
                self.inner.test_id, response
            );
        }
        match self.report_histograms().await {
            Ok(response) if response.is_success() => {}
            Ok(response) => warn!(
                "Histogram report for {} answered {}",
                self.inner.test_id, response
            ),
            Err(err) => warn!("Histogram report for {} failed: {}", self.inner.test_id, err),
        }
    }

    async fn send(&self, operation: SimulatorOperation) -> ResponseType {
        self.inner
            .broker
            .send(&SimulatorAddress::root(), &operation)
            .await
    }
}
