use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;

use super::*;
use crate::error::{AppError, AppResult, CoordinationError};
use crate::metrics::LatencyHistogram;
use crate::processor::{DispatchProfile, LocalExceptionLogger};
use crate::protocol::{
    FailureOperation, FailureType, PerformanceState, PerformanceStateOperation,
    PhaseCompletedOperation, ResponseType, SimulatorAddress, SimulatorOperation,
    TestHistogramOperation, TestId, TestPhase,
};

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: std::future::Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::coordination(format!("Failed to build runtime: {}", err)))?;
    runtime.block_on(future)
}

fn worker(agent: u32, index: u32) -> AppResult<SimulatorAddress> {
    SimulatorAddress::worker(agent, index)
}

fn failure(source: SimulatorAddress, kind: FailureType, message: &str) -> FailureOperation {
    FailureOperation::new(Some(TestId::from("t1")), source, kind, message)
}

fn histogram_of(values: &[u64]) -> AppResult<LatencyHistogram> {
    let mut histogram = LatencyHistogram::new()?;
    for value in values {
        histogram.record(*value)?;
    }
    Ok(histogram)
}

#[test]
fn failure_duplicates_are_counted_not_stored() -> AppResult<()> {
    let failures = FailureContainer::new(Arc::new(Never));
    let source = worker(1, 1)?;
    let first = failures.add_failure(failure(source, FailureType::WorkerException, "boom"));
    let second = failures.add_failure(failure(source, FailureType::WorkerException, "boom"));
    if first != FailureAdded::New || second != (FailureAdded::Duplicate { occurrences: 2 }) {
        return Err(AppError::coordination("Unexpected dedup outcome"));
    }
    if failures.count() != 1 || failures.total_occurrences() != 2 {
        return Err(AppError::coordination("Duplicate must be stored once"));
    }
    let Some(record) = failures.list().into_iter().next() else {
        return Err(AppError::coordination("Missing failure record"));
    };
    if record.occurrences != 2 {
        return Err(AppError::coordination("Occurrence count must be 2"));
    }

    failures.add_failure(failure(source, FailureType::WorkerException, "other"));
    if failures.count() != 2 {
        return Err(AppError::coordination("Different message must be a new entry"));
    }
    let messages: Vec<String> = failures
        .list()
        .into_iter()
        .map(|record| record.failure.message)
        .collect();
    if messages != vec!["boom".to_owned(), "other".to_owned()] {
        return Err(AppError::coordination("Failures must list in arrival order"));
    }
    Ok(())
}

#[test]
fn abort_policy_sees_only_new_failures() -> AppResult<()> {
    let calls = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&calls);
    let failures = FailureContainer::new(Arc::new(move |_failure: &FailureOperation| {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    }));
    let source = worker(1, 2)?;
    for _ in 0..3 {
        failures.add_failure(failure(source, FailureType::WorkerTimeout, "slow"));
    }
    if calls.load(Ordering::SeqCst) != 1 {
        return Err(AppError::coordination("Policy must run once per distinct failure"));
    }
    if failures.is_abort_requested() {
        return Err(AppError::coordination("Policy said no abort"));
    }
    Ok(())
}

#[test]
fn fail_fast_raises_abort_signal_for_poison_failures() -> AppResult<()> {
    let failures = FailureContainer::new(Arc::new(FailFast));
    let signal = failures.abort_signal();
    failures.add_failure(failure(worker(1, 1)?, FailureType::WorkerNormalExit, "done"));
    if failures.is_abort_requested() || *signal.borrow() {
        return Err(AppError::coordination("Normal exit must not abort"));
    }
    failures.add_failure(failure(worker(1, 1)?, FailureType::WorkerOom, "heap"));
    if !failures.is_abort_requested() || !*signal.borrow() {
        return Err(AppError::coordination("OOM must abort under fail-fast"));
    }
    Ok(())
}

#[test]
fn failures_filter_by_test() -> AppResult<()> {
    let failures = FailureContainer::new(Arc::new(Never));
    failures.add_failure(failure(worker(1, 1)?, FailureType::WorkerException, "a"));
    failures.add_failure(FailureOperation::new(
        Some(TestId::from("t2")),
        worker(1, 1)?,
        FailureType::WorkerException,
        "b",
    ));
    if failures.failures_for_test(&TestId::from("t2")).len() != 1 {
        return Err(AppError::coordination("Expected one failure for t2"));
    }
    Ok(())
}

#[test]
fn performance_rejects_non_increasing_counters() -> AppResult<()> {
    let performance = PerformanceStateContainer::new(16, Duration::from_secs(10));
    let test_id = TestId::from("t1");
    let source = worker(1, 1)?;
    let sample = |count: u64, timestamp: u64| PerformanceState {
        operation_count: count,
        timestamp_ms: timestamp,
    };

    if performance.update_at(&test_id, &source, sample(100, 1_000), 1_000) != SampleOutcome::Baseline {
        return Err(AppError::coordination("First sample is the baseline"));
    }
    let accepted = performance.update_at(&test_id, &source, sample(300, 2_000), 2_000);
    if accepted != (SampleOutcome::Accepted { throughput_x100: 20_000 }) {
        return Err(AppError::coordination(format!(
            "Expected 200 ops/s, got {:?}",
            accepted
        )));
    }
    let before = performance.series(&test_id, &source);
    for stale in [sample(250, 3_000), sample(300, 3_000), sample(400, 2_000)] {
        if performance.update_at(&test_id, &source, stale, 3_000) != SampleOutcome::Stale {
            return Err(AppError::coordination("Non-increasing sample must be stale"));
        }
    }
    if performance.series(&test_id, &source) != before {
        return Err(AppError::coordination("Stale samples must not change the series"));
    }
    Ok(())
}

#[test]
fn performance_series_is_monotonic_and_bounded() -> AppResult<()> {
    let performance = PerformanceStateContainer::new(4, Duration::from_secs(10));
    let test_id = TestId::from("t1");
    let source = worker(2, 1)?;
    let mut count = 0_u64;
    for step in 1..=10_u64 {
        count = count.saturating_add(step.saturating_mul(10));
        performance.update_at(
            &test_id,
            &source,
            PerformanceState {
                operation_count: count,
                timestamp_ms: step.saturating_mul(1_000),
            },
            step.saturating_mul(1_000),
        );
    }
    let series = performance.series(&test_id, &source);
    if series.len() != 4 {
        return Err(AppError::coordination("Series must keep only the newest samples"));
    }
    let monotonic = series
        .windows(2)
        .all(|pair| match pair {
            [earlier, later] => {
                later.operation_count > earlier.operation_count
                    && later.timestamp_ms > earlier.timestamp_ms
                    && later.throughput_x100 > earlier.throughput_x100
            }
            _ => false,
        });
    if !monotonic {
        return Err(AppError::coordination("Series must be monotonic"));
    }
    Ok(())
}

#[test]
fn performance_aggregate_sums_sources_and_flags_stale() -> AppResult<()> {
    let performance = PerformanceStateContainer::new(16, Duration::from_secs(5));
    let test_id = TestId::from("t1");
    let fresh = worker(1, 1)?;
    let quiet = worker(1, 2)?;
    for (source, last_seen) in [(fresh, 20_000_u64), (quiet, 2_000_u64)] {
        performance.update_at(
            &test_id,
            &source,
            PerformanceState {
                operation_count: 0,
                timestamp_ms: 0,
            },
            0,
        );
        performance.update_at(
            &test_id,
            &source,
            PerformanceState {
                operation_count: 500,
                timestamp_ms: 1_000,
            },
            last_seen,
        );
    }
    performance.update_at(
        &TestId::from("other"),
        &fresh,
        PerformanceState {
            operation_count: 1,
            timestamp_ms: 1,
        },
        20_000,
    );

    let fleet = performance.aggregate_at(&test_id, 21_000);
    if fleet.sources != 2 || fleet.operation_count != 1_000 {
        return Err(AppError::coordination("Aggregate must cover both sources of t1"));
    }
    if fleet.throughput_x100 != 100_000 {
        return Err(AppError::coordination(format!(
            "Expected 1000 ops/s, got {}",
            fleet.throughput_x100
        )));
    }
    if fleet.stale_sources != vec![quiet] {
        return Err(AppError::coordination("Only the quiet source is stale"));
    }
    if performance.test_ids() != vec![TestId::from("other"), TestId::from("t1")] {
        return Err(AppError::coordination("Unexpected test ids"));
    }
    Ok(())
}

#[test]
fn histogram_merge_is_order_independent() -> AppResult<()> {
    let mut rng = rand::thread_rng();
    let test_id = TestId::from("t1");
    let snapshots: Vec<HistogramSnapshot> = (1..=3_u32)
        .map(|index| -> AppResult<HistogramSnapshot> {
            let values: Vec<u64> = (0..200).map(|_| rng.gen_range(1..50_000)).collect();
            Ok(HistogramSnapshot {
                test_id: test_id.clone(),
                source: worker(1, index)?,
                probe: "latency".to_owned(),
                encoded: histogram_of(&values)?.encode_base64()?,
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    let merged_in = |order: &[usize]| -> AppResult<LatencyHistogram> {
        let container = TestHistogramContainer::new();
        for index in order {
            let Some(snapshot) = snapshots.get(*index) else {
                return Err(AppError::coordination("Bad snapshot index"));
            };
            container.merge(snapshot)?;
        }
        container
            .snapshot(&test_id, "latency")
            .ok_or_else(|| AppError::coordination("Missing merged probe"))
    };

    let reference = merged_in(&[0, 1, 2])?;
    let permutations: [[usize; 3]; 5] = [[0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    for order in &permutations {
        if merged_in(order)? != reference {
            return Err(AppError::coordination(format!(
                "Merge order {:?} changed the result",
                order
            )));
        }
    }
    for _ in 0..10 {
        let mut order = vec![0_usize, 1, 2];
        order.shuffle(&mut rng);
        if merged_in(&order)? != reference {
            return Err(AppError::coordination("Shuffled merge changed the result"));
        }
    }

    let decoded = snapshots
        .iter()
        .map(HistogramSnapshot::decode)
        .collect::<AppResult<Vec<_>>>()?;
    let [first, second, third] = decoded.as_slice() else {
        return Err(AppError::coordination("Expected three histograms"));
    };
    let mut left = first.clone();
    left.merge(second)?;
    left.merge(third)?;
    let mut right_tail = second.clone();
    right_tail.merge(third)?;
    let mut right = first.clone();
    right.merge(&right_tail)?;
    if left != right || left != reference {
        return Err(AppError::coordination("Merge must be associative"));
    }
    Ok(())
}

#[test]
fn histogram_report_with_bad_payload_merges_nothing() -> AppResult<()> {
    let container = TestHistogramContainer::new();
    let source = worker(1, 1)?;
    let mut probe_histograms = BTreeMap::new();
    probe_histograms.insert("get".to_owned(), histogram_of(&[10, 20, 30])?.encode_base64()?);
    probe_histograms.insert("put".to_owned(), "not base64!".to_owned());
    let report = TestHistogramOperation {
        test_id: TestId::from("t1"),
        probe_histograms,
    };
    if container.add_test_histograms(&source, &report).is_ok() {
        return Err(AppError::coordination("Invalid payload must be rejected"));
    }
    if !container.probes(&TestId::from("t1")).is_empty() {
        return Err(AppError::coordination("Nothing may be merged from a bad report"));
    }
    Ok(())
}

#[test]
fn histogram_summary_reports_percentiles_and_sources() -> AppResult<()> {
    let container = TestHistogramContainer::new();
    let test_id = TestId::from("t1");
    for index in 1..=2_u32 {
        let mut probe_histograms = BTreeMap::new();
        probe_histograms.insert("get".to_owned(), histogram_of(&[100, 200, 300])?.encode_base64()?);
        let merged = container.add_test_histograms(
            &worker(1, index)?,
            &TestHistogramOperation {
                test_id: test_id.clone(),
                probe_histograms,
            },
        )?;
        if merged != 1 {
            return Err(AppError::coordination("Expected one merged probe"));
        }
    }
    let summaries = container.summary(&test_id);
    let Some(summary) = summaries.first() else {
        return Err(AppError::coordination("Missing summary"));
    };
    if summary.count != 6 || summary.sources.len() != 2 || container.merges(&test_id, "get") != 2 {
        return Err(AppError::coordination("Summary must cover both sources"));
    }
    if summary.p50 < 190 || summary.p50 > 210 || summary.max < 299 {
        return Err(AppError::coordination(format!(
            "Unexpected percentiles {:?}",
            summary
        )));
    }
    Ok(())
}

#[test]
fn barrier_moves_from_pending_to_complete() -> AppResult<()> {
    run_async_test(async {
        let phases = Arc::new(TestPhaseListenerContainer::new());
        let test_id = TestId::from("t1");
        let members = [worker(1, 1)?, worker(1, 2)?, worker(1, 3)?];
        phases.register_expected(&test_id, TestPhase::Run, members)?;
        if phases.state(&test_id, TestPhase::Run) != Some(PhaseState::Pending) {
            return Err(AppError::coordination("New barrier must be pending"));
        }

        let waiter_phases = Arc::clone(&phases);
        let waiter_test = test_id.clone();
        let waiter = tokio::spawn(async move {
            waiter_phases
                .await_phase(&waiter_test, TestPhase::Run, Duration::from_secs(30))
                .await
        });
        tokio::task::yield_now().await;

        let [first, second, third] = members;
        phases.mark_complete(&test_id, TestPhase::Run, &first)?;
        phases.mark_complete(&test_id, TestPhase::Run, &second)?;
        if phases.state(&test_id, TestPhase::Run) != Some(PhaseState::PartiallyComplete) {
            return Err(AppError::coordination("Two of three must be partial"));
        }
        if phases.mark_complete(&test_id, TestPhase::Run, &second)? != Completion::AlreadyRecorded {
            return Err(AppError::coordination("Repeated completion must be idempotent"));
        }
        phases.mark_complete(&test_id, TestPhase::Run, &third)?;

        let waited = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .map_err(|_elapsed| AppError::coordination("Waiter did not unblock"))??;
        if !waited?.is_complete() {
            return Err(AppError::coordination("Await must unblock on completion"));
        }
        Ok(())
    })
}

#[test]
fn barrier_rejects_unknown_participants_and_unregistered_phases() -> AppResult<()> {
    run_async_test(async {
        let phases = TestPhaseListenerContainer::new();
        let test_id = TestId::from("t1");
        phases.register_expected(&test_id, TestPhase::Warmup, [worker(1, 1)?])?;

        let unknown = phases.mark_complete(&test_id, TestPhase::Warmup, &worker(2, 1)?);
        match unknown {
            Err(err)
                if matches!(
                    err.as_coordination(),
                    Some(CoordinationError::UnknownParticipant { .. })
                ) => {}
            Err(_) | Ok(_) => {
                return Err(AppError::coordination("Expected UnknownParticipant"));
            }
        }

        let unregistered = phases
            .await_phase(&test_id, TestPhase::Run, Duration::from_millis(10))
            .await;
        match unregistered {
            Err(err)
                if matches!(
                    err.as_coordination(),
                    Some(CoordinationError::BarrierNotRegistered { .. })
                ) => {}
            Err(_) | Ok(_) => {
                return Err(AppError::coordination("Expected BarrierNotRegistered"));
            }
        }

        if phases
            .register_expected(&test_id, TestPhase::Warmup, [worker(1, 1)?])
            .is_ok()
        {
            return Err(AppError::coordination("Duplicate registration must fail"));
        }
        if phases
            .register_expected(&test_id, TestPhase::Run, [SimulatorAddress::all_workers()])
            .is_ok()
        {
            return Err(AppError::coordination("Wildcard participants must fail"));
        }
        Ok(())
    })
}

#[test]
fn barrier_timeout_returns_partial_progress() -> AppResult<()> {
    run_async_test(async {
        let phases = TestPhaseListenerContainer::new();
        let test_id = TestId::from("t1");
        let done = worker(1, 1)?;
        let missing = worker(1, 2)?;
        phases.register_expected(&test_id, TestPhase::Setup, [done, missing])?;
        phases.mark_complete(&test_id, TestPhase::Setup, &done)?;
        let waited = phases
            .await_phase(&test_id, TestPhase::Setup, Duration::from_millis(20))
            .await?;
        let PhaseAwait::TimedOut(progress) = waited else {
            return Err(AppError::coordination("Expected a timeout result"));
        };
        if progress.pending() != vec![missing] || progress.state != PhaseState::PartiallyComplete {
            return Err(AppError::coordination("Timeout must report what is missing"));
        }
        Ok(())
    })
}

#[test]
fn losing_an_agent_force_completes_its_workers() -> AppResult<()> {
    run_async_test(async {
        let phases = TestPhaseListenerContainer::new();
        let test_id = TestId::from("t1");
        let survivor = worker(2, 1)?;
        phases.register_expected(
            &test_id,
            TestPhase::Run,
            [worker(1, 1)?, worker(1, 2)?, survivor],
        )?;
        let forced = phases.force_complete_member(&SimulatorAddress::agent(1)?);
        if forced != 2 {
            return Err(AppError::coordination(format!("Expected 2 forced, got {}", forced)));
        }
        phases.mark_complete(&test_id, TestPhase::Run, &survivor)?;
        let waited = phases
            .await_phase(&test_id, TestPhase::Run, Duration::from_millis(50))
            .await?;
        let PhaseAwait::Complete(progress) = waited else {
            return Err(AppError::coordination("Expected completion"));
        };
        if progress.forced.len() != 2 || progress.forced.contains(&survivor) {
            return Err(AppError::coordination("Forced entries must be audited"));
        }
        Ok(())
    })
}

#[test]
fn cancelling_a_test_releases_waiters() -> AppResult<()> {
    run_async_test(async {
        let phases = Arc::new(TestPhaseListenerContainer::new());
        let test_id = TestId::from("t1");
        phases.register_expected(&test_id, TestPhase::Run, [worker(1, 1)?])?;
        let waiter_phases = Arc::clone(&phases);
        let waiter_test = test_id.clone();
        let waiter = tokio::spawn(async move {
            waiter_phases
                .await_phase(&waiter_test, TestPhase::Run, Duration::from_secs(30))
                .await
        });
        tokio::task::yield_now().await;
        phases.remove_test(&test_id);
        let waited = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .map_err(|_elapsed| AppError::coordination("Waiter leaked"))??;
        if !matches!(waited?, PhaseAwait::Cancelled(_)) {
            return Err(AppError::coordination("Expected cancellation"));
        }
        if phases.state(&test_id, TestPhase::Run).is_some() {
            return Err(AppError::coordination("Removed test must have no barriers"));
        }
        Ok(())
    })
}

#[test]
fn empty_barrier_is_vacuously_complete() -> AppResult<()> {
    run_async_test(async {
        let phases = TestPhaseListenerContainer::new();
        let test_id = TestId::from("t1");
        phases.register_expected(&test_id, TestPhase::GlobalVerify, [])?;
        let waited = phases
            .await_phase(&test_id, TestPhase::GlobalVerify, Duration::from_millis(10))
            .await?;
        if !waited.is_complete() {
            return Err(AppError::coordination("Empty barrier must complete"));
        }
        Ok(())
    })
}

#[test]
fn full_profile_routes_reports_into_containers() -> AppResult<()> {
    let state = CoordinatorState::default();
    let processor = coordinator_processor(
        DispatchProfile::Full,
        &state,
        Arc::new(LocalExceptionLogger::new()),
    );
    let test_id = TestId::from("t1");
    let expected = worker(1, 1)?;
    let lost = worker(1, 2)?;
    state
        .phases
        .register_expected(&test_id, TestPhase::Run, [expected, lost])?;

    let completed = SimulatorOperation::PhaseCompleted(PhaseCompletedOperation {
        test_id: test_id.clone(),
        phase: TestPhase::Run,
    });
    if processor.dispatch(&completed, &worker(3, 3)?) != ResponseType::UnknownParticipant {
        return Err(AppError::coordination("Unexpected participant must be rejected"));
    }
    if processor.dispatch(&completed, &expected) != ResponseType::Success {
        return Err(AppError::coordination("Expected participant must complete"));
    }

    let oom = SimulatorOperation::Failure(failure(lost, FailureType::WorkerOom, "heap"));
    if processor.dispatch(&oom, &SimulatorAddress::agent(1)?) != ResponseType::Success {
        return Err(AppError::coordination("Failure must be accepted"));
    }
    if state.phases.state(&test_id, TestPhase::Run) != Some(PhaseState::Complete) {
        return Err(AppError::coordination("Finished worker must be force-completed"));
    }
    if state.failures.count() != 1 {
        return Err(AppError::coordination("Failure must be recorded"));
    }

    let mut states = BTreeMap::new();
    states.insert(
        test_id.clone(),
        PerformanceState {
            operation_count: 10,
            timestamp_ms: 5,
        },
    );
    let performance = SimulatorOperation::PerformanceState(PerformanceStateOperation { states });
    if processor.dispatch(&performance, &expected) != ResponseType::Success {
        return Err(AppError::coordination("Performance report must be accepted"));
    }
    if state.performance.series(&test_id, &expected).len() != 1 {
        return Err(AppError::coordination("Performance sample must be stored"));
    }
    Ok(())
}

#[test]
fn minimal_profile_only_logs_exceptions() -> AppResult<()> {
    let state = CoordinatorState::default();
    let processor = coordinator_processor(
        DispatchProfile::Minimal,
        &state,
        Arc::new(LocalExceptionLogger::new()),
    );
    let report = SimulatorOperation::Failure(failure(
        worker(1, 1)?,
        FailureType::WorkerException,
        "ignored",
    ));
    if processor.dispatch(&report, &worker(1, 1)?)
        != ResponseType::UnsupportedOperationOnThisProcessor
    {
        return Err(AppError::coordination("Minimal profile must not handle failures"));
    }
    if state.failures.count() != 0 {
        return Err(AppError::coordination("Unsupported dispatch must not record"));
    }
    if processor.supported_types() != vec![crate::protocol::OperationType::Exception] {
        return Err(AppError::coordination("Minimal profile handles EXCEPTION only"));
    }
    Ok(())
}
