use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, CoordinationError};
use crate::protocol::{SimulatorAddress, TestId, TestPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Pending,
    PartiallyComplete,
    Complete,
}

/// Point-in-time view of one barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseProgress {
    pub test_id: TestId,
    pub phase: TestPhase,
    pub state: PhaseState,
    pub expected: BTreeSet<SimulatorAddress>,
    pub completed: BTreeSet<SimulatorAddress>,
    /// Entries completed administratively after their node was lost.
    pub forced: BTreeSet<SimulatorAddress>,
}

impl PhaseProgress {
    #[must_use]
    pub fn pending(&self) -> Vec<SimulatorAddress> {
        self.expected.difference(&self.completed).copied().collect()
    }
}

/// Outcome of waiting on a barrier. None of these is an error: the caller
/// decides what a partial completion means for the test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseAwait {
    Complete(PhaseProgress),
    TimedOut(PhaseProgress),
    Cancelled(PhaseProgress),
}

impl PhaseAwait {
    #[must_use]
    pub const fn progress(&self) -> &PhaseProgress {
        match self {
            PhaseAwait::Complete(progress)
            | PhaseAwait::TimedOut(progress)
            | PhaseAwait::Cancelled(progress) => progress,
        }
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, PhaseAwait::Complete(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Recorded,
    AlreadyRecorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarrierSignal {
    Waiting,
    Complete,
    Cancelled,
}

#[derive(Debug)]
struct BarrierState {
    expected: BTreeSet<SimulatorAddress>,
    completed: BTreeSet<SimulatorAddress>,
    forced: BTreeSet<SimulatorAddress>,
    cancelled: bool,
}

impl BarrierState {
    fn phase_state(&self) -> PhaseState {
        if self.completed.len() == self.expected.len() {
            PhaseState::Complete
        } else if self.completed.is_empty() {
            PhaseState::Pending
        } else {
            PhaseState::PartiallyComplete
        }
    }
}

#[derive(Debug)]
struct PhaseBarrier {
    state: Mutex<BarrierState>,
    signal: watch::Sender<BarrierSignal>,
}

impl PhaseBarrier {
    fn new(expected: BTreeSet<SimulatorAddress>) -> Self {
        let initial = if expected.is_empty() {
            BarrierSignal::Complete
        } else {
            BarrierSignal::Waiting
        };
        let (signal, _) = watch::channel(initial);
        Self {
            state: Mutex::new(BarrierState {
                expected,
                completed: BTreeSet::new(),
                forced: BTreeSet::new(),
                cancelled: false,
            }),
            signal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn progress(&self, test_id: &TestId, phase: TestPhase) -> PhaseProgress {
        let state = self.lock();
        PhaseProgress {
            test_id: test_id.clone(),
            phase,
            state: state.phase_state(),
            expected: state.expected.clone(),
            completed: state.completed.clone(),
            forced: state.forced.clone(),
        }
    }

    fn complete_member(
        &self,
        test_id: &TestId,
        phase: TestPhase,
        address: &SimulatorAddress,
        forced: bool,
    ) -> AppResult<Completion> {
        let mut state = self.lock();
        if !state.expected.contains(address) {
            return Err(AppError::coordination(
                CoordinationError::UnknownParticipant {
                    test_id: test_id.to_string(),
                    phase: phase.as_str(),
                    address: address.to_string(),
                },
            ));
        }
        if !state.completed.insert(*address) {
            return Ok(Completion::AlreadyRecorded);
        }
        if forced {
            state.forced.insert(*address);
        }
        if state.phase_state() == PhaseState::Complete && !state.cancelled {
            self.signal.send_replace(BarrierSignal::Complete);
        }
        Ok(Completion::Recorded)
    }
}

/// Completion barriers keyed by `(test, phase)`.
#[derive(Debug, Default)]
pub struct TestPhaseListenerContainer {
    barriers: DashMap<(TestId, TestPhase), Arc<PhaseBarrier>>,
}

impl TestPhaseListenerContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the barrier for `(test_id, phase)`; an empty set completes
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns an error for wildcard participants or when the barrier already
    /// exists.
    pub fn register_expected<I>(&self, test_id: &TestId, phase: TestPhase, addresses: I) -> AppResult<()>
    where
        I: IntoIterator<Item = SimulatorAddress>,
    {
        let mut expected = BTreeSet::new();
        for address in addresses {
            if address.is_wildcard() {
                return Err(AppError::coordination(
                    CoordinationError::WildcardParticipant {
                        address: address.to_string(),
                    },
                ));
            }
            expected.insert(address);
        }
        match self.barriers.entry((test_id.clone(), phase)) {
            Entry::Occupied(_) => Err(AppError::coordination(
                CoordinationError::BarrierAlreadyRegistered {
                    test_id: test_id.to_string(),
                    phase: phase.as_str(),
                },
            )),
            Entry::Vacant(entry) => {
                debug!(
                    "Registered barrier {}/{} with {} participant(s)",
                    test_id,
                    phase,
                    expected.len()
                );
                entry.insert(Arc::new(PhaseBarrier::new(expected)));
                Ok(())
            }
        }
    }

    /// Records that `address` finished `phase`; repeats are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error when no barrier is registered or `address` is not an
    /// expected participant.
    pub fn mark_complete(
        &self,
        test_id: &TestId,
        phase: TestPhase,
        address: &SimulatorAddress,
    ) -> AppResult<Completion> {
        self.barrier(test_id, phase)?
            .complete_member(test_id, phase, address, false)
    }

    /// Treats `address` as done because it will never report: its node is
    /// gone or it refused the phase.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::mark_complete`].
    pub fn force_complete(
        &self,
        test_id: &TestId,
        phase: TestPhase,
        address: &SimulatorAddress,
    ) -> AppResult<Completion> {
        let completion = self
            .barrier(test_id, phase)?
            .complete_member(test_id, phase, address, true)?;
        if completion == Completion::Recorded {
            warn!("Force-completed {} for {}/{}", address, test_id, phase);
        }
        Ok(completion)
    }

    /// Force-completes every pending entry contained by `lost` across all
    /// barriers; losing an agent covers its workers. Returns the number of
    /// entries completed.
    pub fn force_complete_member(&self, lost: &SimulatorAddress) -> usize {
        let barriers: Vec<((TestId, TestPhase), Arc<PhaseBarrier>)> = self
            .barriers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let mut forced = 0_usize;
        for ((test_id, phase), barrier) in barriers {
            let members: Vec<SimulatorAddress> = {
                let state = barrier.lock();
                state
                    .expected
                    .difference(&state.completed)
                    .filter(|member| lost.contains(member))
                    .copied()
                    .collect()
            };
            for member in members {
                if let Ok(Completion::Recorded) =
                    barrier.complete_member(&test_id, phase, &member, true)
                {
                    warn!(
                        "Force-completed {} for {}/{} after losing {}",
                        member, test_id, phase, lost
                    );
                    forced = forced.saturating_add(1);
                }
            }
        }
        forced
    }

    #[must_use]
    pub fn state(&self, test_id: &TestId, phase: TestPhase) -> Option<PhaseState> {
        self.progress(test_id, phase).map(|progress| progress.state)
    }

    #[must_use]
    pub fn progress(&self, test_id: &TestId, phase: TestPhase) -> Option<PhaseProgress> {
        self.barriers
            .get(&(test_id.clone(), phase))
            .map(|barrier| Arc::clone(barrier.value()))
            .map(|barrier| barrier.progress(test_id, phase))
    }

    /// Suspends the caller until the barrier completes, `timeout` elapses or
    /// the test is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error when no barrier is registered for `(test_id, phase)`.
    pub async fn await_phase(
        &self,
        test_id: &TestId,
        phase: TestPhase,
        timeout: Duration,
    ) -> AppResult<PhaseAwait> {
        let barrier = self.barrier(test_id, phase)?;
        let mut receiver = barrier.signal.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(|signal| *signal != BarrierSignal::Waiting)
                .await
                .map(|signal| *signal)
        })
        .await;
        let signal = match waited {
            Ok(Ok(signal)) => Some(signal),
            Ok(Err(_closed)) => Some(BarrierSignal::Cancelled),
            Err(_elapsed) => None,
        };
        let progress = barrier.progress(test_id, phase);
        Ok(match signal {
            Some(BarrierSignal::Complete) => PhaseAwait::Complete(progress),
            Some(BarrierSignal::Cancelled) => PhaseAwait::Cancelled(progress),
            Some(BarrierSignal::Waiting) | None => PhaseAwait::TimedOut(progress),
        })
    }

    /// Wakes every waiter of `test_id` with a cancelled result.
    pub fn cancel_test(&self, test_id: &TestId) {
        for entry in self.barriers.iter() {
            if &entry.key().0 != test_id {
                continue;
            }
            let barrier = entry.value();
            let mut state = barrier.lock();
            if state.phase_state() != PhaseState::Complete {
                state.cancelled = true;
                barrier.signal.send_replace(BarrierSignal::Cancelled);
            }
        }
        info!("Cancelled outstanding barriers of test {}", test_id);
    }

    /// Drops every barrier of `test_id`, cancelling any still pending.
    pub fn remove_test(&self, test_id: &TestId) {
        self.cancel_test(test_id);
        self.barriers.retain(|(entry_test, _), _| entry_test != test_id);
    }

    fn barrier(&self, test_id: &TestId, phase: TestPhase) -> AppResult<Arc<PhaseBarrier>> {
        self.barriers
            .get(&(test_id.clone(), phase))
            .map(|barrier| Arc::clone(barrier.value()))
            .ok_or_else(|| {
                AppError::coordination(CoordinationError::BarrierNotRegistered {
                    test_id: test_id.to_string(),
                    phase: phase.as_str(),
                })
            })
    }
}
