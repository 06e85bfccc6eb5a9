use std::collections::BTreeSet;

use dashmap::DashMap;

use crate::error::{AppError, AppResult, MetricsError};
use crate::metrics::LatencyHistogram;
use crate::protocol::{SimulatorAddress, TestHistogramOperation, TestId};

/// One encoded probe histogram as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub test_id: TestId,
    pub source: SimulatorAddress,
    pub probe: String,
    pub encoded: String,
}

impl HistogramSnapshot {
    /// # Errors
    ///
    /// Returns an error when the payload is not a valid base64 V2 histogram.
    pub fn decode(&self) -> AppResult<LatencyHistogram> {
        LatencyHistogram::decode_base64(&self.encoded).map_err(|err| {
            AppError::metrics(MetricsError::ProbeMerge {
                test_id: self.test_id.to_string(),
                probe: self.probe.clone(),
                source: Box::new(err),
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSummary {
    pub probe: String,
    pub count: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub max: u64,
    pub sources: Vec<SimulatorAddress>,
}

#[derive(Debug)]
struct ProbeAggregate {
    histogram: LatencyHistogram,
    sources: BTreeSet<SimulatorAddress>,
    merges: u64,
}

/// Running per `(test, probe)` histogram merge.
#[derive(Debug, Default)]
pub struct TestHistogramContainer {
    probes: DashMap<(TestId, String), ProbeAggregate>,
}

impl TestHistogramContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes and merges one snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload does not decode or cannot be merged.
    pub fn merge(&self, snapshot: &HistogramSnapshot) -> AppResult<()> {
        let histogram = snapshot.decode()?;
        self.merge_histogram(
            &snapshot.test_id,
            &snapshot.source,
            &snapshot.probe,
            &histogram,
        )
    }

    /// Merges an already decoded histogram.
    ///
    /// # Errors
    ///
    /// Returns an error when the histogram cannot be added to the aggregate.
    pub fn merge_histogram(
        &self,
        test_id: &TestId,
        source: &SimulatorAddress,
        probe: &str,
        histogram: &LatencyHistogram,
    ) -> AppResult<()> {
        let mut aggregate = self
            .probes
            .entry((test_id.clone(), probe.to_owned()))
            .or_try_insert_with(|| {
                Ok::<_, AppError>(ProbeAggregate {
                    histogram: LatencyHistogram::new()?,
                    sources: BTreeSet::new(),
                    merges: 0,
                })
            })?;
        aggregate.histogram.merge(histogram)?;
        aggregate.sources.insert(*source);
        aggregate.merges = aggregate.merges.saturating_add(1);
        Ok(())
    }

    /// Merges every probe of one report; nothing is merged if any payload is
    /// invalid.
    ///
    /// # Errors
    ///
    /// Returns the first decode or merge error.
    pub fn add_test_histograms(
        &self,
        source: &SimulatorAddress,
        operation: &TestHistogramOperation,
    ) -> AppResult<usize> {
        let decoded = operation
            .probe_histograms
            .iter()
            .map(|(probe, encoded)| {
                HistogramSnapshot {
                    test_id: operation.test_id.clone(),
                    source: *source,
                    probe: probe.clone(),
                    encoded: encoded.clone(),
                }
                .decode()
                .map(|histogram| (probe, histogram))
            })
            .collect::<AppResult<Vec<_>>>()?;
        for (probe, histogram) in &decoded {
            self.merge_histogram(&operation.test_id, source, probe, histogram)?;
        }
        Ok(decoded.len())
    }

    /// Copy of the combined distribution; merges continue unblocked.
    #[must_use]
    pub fn snapshot(&self, test_id: &TestId, probe: &str) -> Option<LatencyHistogram> {
        self.probes
            .get(&(test_id.clone(), probe.to_owned()))
            .map(|aggregate| aggregate.histogram.clone())
    }

    #[must_use]
    pub fn merges(&self, test_id: &TestId, probe: &str) -> u64 {
        self.probes
            .get(&(test_id.clone(), probe.to_owned()))
            .map_or(0, |aggregate| aggregate.merges)
    }

    #[must_use]
    pub fn probes(&self, test_id: &TestId) -> Vec<String> {
        let mut probes: Vec<String> = self
            .probes
            .iter()
            .filter(|entry| &entry.key().0 == test_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        probes.sort();
        probes
    }

    #[must_use]
    pub fn summary(&self, test_id: &TestId) -> Vec<ProbeSummary> {
        let mut summaries: Vec<ProbeSummary> = self
            .probes
            .iter()
            .filter(|entry| &entry.key().0 == test_id)
            .map(|entry| {
                let aggregate = entry.value();
                let (p50, p90, p99) = aggregate.histogram.percentiles();
                ProbeSummary {
                    probe: entry.key().1.clone(),
                    count: aggregate.histogram.count(),
                    p50,
                    p90,
                    p99,
                    max: aggregate.histogram.max(),
                    sources: aggregate.sources.iter().copied().collect(),
                }
            })
            .collect();
        summaries.sort_by(|left, right| left.probe.cmp(&right.probe));
        summaries
    }

    pub fn remove_test(&self, test_id: &TestId) {
        self.probes.retain(|(entry_test, _), _| entry_test != test_id);
    }
}
