use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::protocol::{PerformanceState, PerformanceStateOperation, SimulatorAddress, TestId};
use crate::utils::{current_time_ms, duration_to_ms};

pub const DEFAULT_SERIES_CAPACITY: usize = 1024;
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(10);

/// One accepted sample of a source's series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceSample {
    pub operation_count: u64,
    pub timestamp_ms: u64,
    /// Ops/sec x100 over the interval since the previous sample; `None` for
    /// the first sample of a series.
    pub throughput_x100: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Baseline,
    Accepted { throughput_x100: u64 },
    /// Counter or timestamp did not advance; the sample was dropped.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetThroughput {
    pub throughput_x100: u64,
    pub operation_count: u64,
    pub sources: usize,
    pub stale_sources: Vec<SimulatorAddress>,
}

#[derive(Debug)]
struct SourceSeries {
    samples: VecDeque<PerformanceSample>,
    last_seen_ms: u64,
}

impl SourceSeries {
    fn latest(&self) -> Option<&PerformanceSample> {
        self.samples.back()
    }

    fn push(&mut self, sample: PerformanceSample, capacity: usize, now_ms: u64) {
        if self.samples.len() >= capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.last_seen_ms = now_ms;
    }
}

fn interval_throughput_x100(previous: &PerformanceSample, next: &PerformanceState) -> u64 {
    let delta_count = next.operation_count.saturating_sub(previous.operation_count);
    let delta_ms = next.timestamp_ms.saturating_sub(previous.timestamp_ms);
    delta_count
        .saturating_mul(100_000)
        .checked_div(delta_ms)
        .unwrap_or(0)
}

/// Per `(test, source)` throughput series.
#[derive(Debug)]
pub struct PerformanceStateContainer {
    series: DashMap<(TestId, SimulatorAddress), SourceSeries>,
    capacity: usize,
    staleness_window_ms: u64,
}

impl PerformanceStateContainer {
    #[must_use]
    pub fn new(capacity: usize, staleness_window: Duration) -> Self {
        Self {
            series: DashMap::new(),
            capacity: capacity.max(1),
            staleness_window_ms: duration_to_ms(staleness_window),
        }
    }

    pub fn update(
        &self,
        test_id: &TestId,
        source: &SimulatorAddress,
        state: PerformanceState,
    ) -> SampleOutcome {
        self.update_at(test_id, source, state, current_time_ms())
    }

    /// Merges a sample received at `now_ms` (local clock, used for staleness).
    pub fn update_at(
        &self,
        test_id: &TestId,
        source: &SimulatorAddress,
        state: PerformanceState,
        now_ms: u64,
    ) -> SampleOutcome {
        match self.series.entry((test_id.clone(), *source)) {
            Entry::Vacant(entry) => {
                let mut series = SourceSeries {
                    samples: VecDeque::new(),
                    last_seen_ms: now_ms,
                };
                series.push(
                    PerformanceSample {
                        operation_count: state.operation_count,
                        timestamp_ms: state.timestamp_ms,
                        throughput_x100: None,
                    },
                    self.capacity,
                    now_ms,
                );
                entry.insert(series);
                SampleOutcome::Baseline
            }
            Entry::Occupied(mut entry) => {
                let series = entry.get_mut();
                let Some(previous) = series.latest().copied() else {
                    return SampleOutcome::Stale;
                };
                if state.operation_count <= previous.operation_count
                    || state.timestamp_ms <= previous.timestamp_ms
                {
                    debug!(
                        "Dropping stale sample from {} for {} (count {} <= {} or ts {} <= {})",
                        source,
                        test_id,
                        state.operation_count,
                        previous.operation_count,
                        state.timestamp_ms,
                        previous.timestamp_ms
                    );
                    return SampleOutcome::Stale;
                }
                let throughput_x100 = interval_throughput_x100(&previous, &state);
                series.push(
                    PerformanceSample {
                        operation_count: state.operation_count,
                        timestamp_ms: state.timestamp_ms,
                        throughput_x100: Some(throughput_x100),
                    },
                    self.capacity,
                    now_ms,
                );
                SampleOutcome::Accepted { throughput_x100 }
            }
        }
    }

    /// Applies every per-test state carried by one report.
    pub fn update_all(
        &self,
        source: &SimulatorAddress,
        operation: &PerformanceStateOperation,
    ) -> Vec<SampleOutcome> {
        operation
            .states
            .iter()
            .map(|(test_id, state)| self.update(test_id, source, *state))
            .collect()
    }

    #[must_use]
    pub fn aggregate(&self, test_id: &TestId) -> FleetThroughput {
        self.aggregate_at(test_id, current_time_ms())
    }

    /// Sums the latest interval throughput of every source of `test_id`.
    /// Stale sources still count; they are only listed.
    #[must_use]
    pub fn aggregate_at(&self, test_id: &TestId, now_ms: u64) -> FleetThroughput {
        let mut fleet = FleetThroughput {
            throughput_x100: 0,
            operation_count: 0,
            sources: 0,
            stale_sources: Vec::new(),
        };
        for entry in self.series.iter() {
            let (entry_test, source) = entry.key();
            if entry_test != test_id {
                continue;
            }
            let series = entry.value();
            fleet.sources = fleet.sources.saturating_add(1);
            if let Some(latest) = series.latest() {
                fleet.operation_count = fleet.operation_count.saturating_add(latest.operation_count);
                fleet.throughput_x100 = fleet
                    .throughput_x100
                    .saturating_add(latest.throughput_x100.unwrap_or(0));
            }
            if now_ms.saturating_sub(series.last_seen_ms) > self.staleness_window_ms {
                fleet.stale_sources.push(*source);
            }
        }
        fleet.stale_sources.sort();
        fleet
    }

    #[must_use]
    pub fn series(&self, test_id: &TestId, source: &SimulatorAddress) -> Vec<PerformanceSample> {
        self.series
            .get(&(test_id.clone(), *source))
            .map(|series| series.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn test_ids(&self) -> Vec<TestId> {
        self.series
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect::<BTreeSet<TestId>>()
            .into_iter()
            .collect()
    }
}

impl Default for PerformanceStateContainer {
    fn default() -> Self {
        Self::new(DEFAULT_SERIES_CAPACITY, DEFAULT_STALENESS_WINDOW)
    }
}
