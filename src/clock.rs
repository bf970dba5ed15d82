use std::{
    sync::{
        Condvar, Mutex,
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tracing::{debug, error};

use crate::{
    domain::SymbolId,
    error::{RewindResult, RuntimeError},
};

/// One advanced virtual step: the new time and the per-symbol
/// data-availability bits for that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepAdvance {
    pub time_ms: i64,
    /// Bit `i` set = symbol `i` has data at the new instant.
    pub availability: u64,
}

/// What a participant observes coming out of [`ReplayClock::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A new step was entered; reads of the clock are consistent with it
    /// until the participant's next `sync`.
    Step { generation: u64 },
    /// The replay is over (data exhausted or aborted); exit the loop.
    Finished,
    /// The wait expired before every participant arrived.
    Timeout,
}

/// The advancement hook run by the last arriver while holding the clock
/// lock. `Ok(None)` means the data sources are exhausted.
pub type Advancer = Box<dyn FnMut() -> RewindResult<Option<StepAdvance>> + Send>;

struct ClockInner {
    participants: usize,
    arrived: usize,
    generation: u64,
    advancer: Advancer,
    /// First advancement failure, surfaced to every participant.
    failure: Option<String>,
}

// ================================================================================================
// ReplayClock
// ================================================================================================

/// The virtual clock and its reusable two-phase barrier.
///
/// Exactly one thread advances time per step: the last participant to arrive
/// at `sync` runs the advancement hook under the clock lock, publishes the
/// new instant and availability bitmap, bumps the generation and wakes the
/// rest. Between two of its own `sync` calls a participant reads a frozen,
/// consistent `(time, availability)` pair through lock-free loads.
///
/// The bitmap is double-buffered: the writer fills the inactive word and
/// swaps the selector with Release ordering; readers load the selector and
/// word with Acquire. The clock moves strictly forward.
pub struct ReplayClock {
    inner: Mutex<ClockInner>,
    barrier: Condvar,
    buffers: [AtomicU64; 2],
    active: AtomicUsize,
    time_ms: AtomicI64,
    finished: AtomicBool,
}

impl ReplayClock {
    pub fn new(participants: usize, advancer: Advancer) -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                participants,
                arrived: 0,
                generation: 0,
                advancer,
                failure: None,
            }),
            barrier: Condvar::new(),
            buffers: [AtomicU64::new(0), AtomicU64::new(0)],
            active: AtomicUsize::new(0),
            time_ms: AtomicI64::new(i64::MIN),
            finished: AtomicBool::new(false),
        }
    }

    // ============================================================================================
    // Lock-Free Reads
    // ============================================================================================

    /// The current virtual instant, identical for every participant within
    /// one generation. `i64::MIN` before the first step.
    pub fn current_time_ms(&self) -> i64 {
        self.time_ms.load(Ordering::Acquire)
    }

    /// Whether `symbol` has data at the current instant.
    pub fn has_data(&self, symbol: SymbolId) -> bool {
        self.availability() & (1u64 << symbol.0) != 0
    }

    /// The full availability word for the current step.
    pub fn availability(&self) -> u64 {
        let active = self.active.load(Ordering::Acquire);
        self.buffers[active].load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().expect("clock lock poisoned").generation
    }

    // ============================================================================================
    // Barrier Protocol
    // ============================================================================================

    /// Arrives at the barrier. The last arrival advances time and wakes
    /// everyone; the rest block until the generation turns or `timeout`
    /// expires.
    pub fn sync(&self, timeout: Duration) -> RewindResult<SyncOutcome> {
        let mut inner = self.inner.lock().expect("clock lock poisoned");
        if self.finished.load(Ordering::Acquire) {
            return self.exit_outcome(&inner);
        }

        inner.arrived += 1;
        if inner.arrived == inner.participants {
            let outcome = self.advance_locked(&mut inner);
            self.barrier.notify_all();
            return outcome;
        }

        let my_generation = inner.generation;
        let (inner, wait) = self
            .barrier
            .wait_timeout_while(inner, timeout, |inner| {
                inner.generation == my_generation && inner.failure.is_none()
                    && !self.finished.load(Ordering::Acquire)
            })
            .map_err(|_| RuntimeError::Aborted("clock lock poisoned".to_string()))?;

        if wait.timed_out()
            && inner.generation == my_generation
            && inner.failure.is_none()
            && !self.finished.load(Ordering::Acquire)
        {
            return Ok(SyncOutcome::Timeout);
        }
        self.exit_outcome(&inner)
    }

    /// Runs the single-owner time-advancement sequence. Caller holds the
    /// clock lock and is the last arrival of the closing generation.
    fn advance_locked(&self, inner: &mut ClockInner) -> RewindResult<SyncOutcome> {
        let result = (inner.advancer)();
        inner.arrived = 0;
        inner.generation += 1;

        match result {
            Ok(Some(step)) => {
                // Fill the inactive buffer, then swap the selector so
                // readers flip atomically to the new word.
                let inactive = 1 - self.active.load(Ordering::Relaxed);
                self.buffers[inactive].store(step.availability, Ordering::Release);
                self.active.store(inactive, Ordering::Release);

                debug_assert!(
                    step.time_ms >= self.time_ms.load(Ordering::Relaxed),
                    "virtual clock moved backwards"
                );
                self.time_ms.store(step.time_ms, Ordering::Release);
                Ok(SyncOutcome::Step {
                    generation: inner.generation,
                })
            }
            Ok(None) => {
                debug!("Data exhausted; finishing replay");
                self.finished.store(true, Ordering::Release);
                Ok(SyncOutcome::Finished)
            }
            Err(e) => {
                error!(error = %e, "Time advancement failed");
                inner.failure = Some(e.to_string());
                self.finished.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    fn exit_outcome(&self, inner: &ClockInner) -> RewindResult<SyncOutcome> {
        if let Some(failure) = &inner.failure {
            return Err(RuntimeError::Aborted(failure.clone()).into());
        }
        if self.finished.load(Ordering::Acquire) {
            return Ok(SyncOutcome::Finished);
        }
        Ok(SyncOutcome::Step {
            generation: inner.generation,
        })
    }

    /// Cleanly removes the caller from the participant set before the next
    /// generation begins (a symbol whose data ran out mid-run). If everyone
    /// else has already arrived, the leaver performs the advancement it
    /// would otherwise have blocked.
    pub fn leave(&self) -> RewindResult<()> {
        let mut inner = self.inner.lock().expect("clock lock poisoned");
        inner.participants -= 1;
        if inner.participants == 0 {
            self.finished.store(true, Ordering::Release);
            self.barrier.notify_all();
            return Ok(());
        }
        if inner.arrived == inner.participants && !self.finished.load(Ordering::Acquire) {
            let outcome = self.advance_locked(&mut inner);
            self.barrier.notify_all();
            outcome.map(|_| ())
        } else {
            Ok(())
        }
    }

    /// Marks the run failed and releases every waiter. A partial ledger is
    /// still collected by the controller.
    pub fn abort(&self, reason: &str) {
        let mut inner = self.inner.lock().expect("clock lock poisoned");
        inner.failure = Some(reason.to_string());
        inner.generation += 1;
        self.finished.store(true, Ordering::Release);
        self.barrier.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, atomic::AtomicU32};

    const STEP_TIMEOUT: Duration = Duration::from_secs(5);

    fn counting_clock(participants: usize, steps: i64) -> ReplayClock {
        let mut next = 0i64;
        ReplayClock::new(
            participants,
            Box::new(move || {
                next += 1;
                if next > steps {
                    return Ok(None);
                }
                Ok(Some(StepAdvance {
                    time_ms: next * 1_000,
                    // Odd steps: symbol 0; even steps: symbols 0 and 1.
                    availability: if next % 2 == 0 { 0b11 } else { 0b01 },
                }))
            }),
        )
    }

    #[test]
    fn single_participant_drives_all_steps() {
        let clock = counting_clock(1, 3);
        for expected in 1..=3i64 {
            let outcome = clock.sync(STEP_TIMEOUT).unwrap();
            assert!(matches!(outcome, SyncOutcome::Step { .. }));
            assert_eq!(clock.current_time_ms(), expected * 1_000);
        }
        assert_eq!(clock.sync(STEP_TIMEOUT).unwrap(), SyncOutcome::Finished);
        assert!(clock.is_finished());
    }

    #[test]
    fn all_participants_observe_the_same_time_per_generation() {
        let clock = Arc::new(counting_clock(4, 50));
        let mismatches = Arc::new(AtomicU32::new(0));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let clock = Arc::clone(&clock);
                let mismatches = Arc::clone(&mismatches);
                scope.spawn(move || {
                    let mut last_seen = i64::MIN;
                    loop {
                        match clock.sync(STEP_TIMEOUT).unwrap() {
                            SyncOutcome::Step { generation } => {
                                let observed = clock.current_time_ms();
                                // Time must advance monotonically and match
                                // the generation number exactly.
                                if observed <= last_seen
                                    || observed != (generation as i64) * 1_000
                                {
                                    mismatches.fetch_add(1, Ordering::Relaxed);
                                }
                                last_seen = observed;
                            }
                            SyncOutcome::Finished => break,
                            SyncOutcome::Timeout => {
                                mismatches.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                });
            }
        });

        assert_eq!(mismatches.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn availability_bitmap_reflects_the_current_step() {
        let clock = counting_clock(1, 2);

        clock.sync(STEP_TIMEOUT).unwrap();
        assert!(clock.has_data(SymbolId(0)));
        assert!(!clock.has_data(SymbolId(1)), "odd step exposes symbol 0 only");

        clock.sync(STEP_TIMEOUT).unwrap();
        assert!(clock.has_data(SymbolId(0)));
        assert!(clock.has_data(SymbolId(1)));
    }

    #[test]
    fn leaver_completes_the_generation_for_the_rest() {
        let clock = Arc::new(counting_clock(2, 3));

        std::thread::scope(|scope| {
            let runner = {
                let clock = Arc::clone(&clock);
                scope.spawn(move || {
                    let mut steps = 0;
                    while let SyncOutcome::Step { .. } = clock.sync(STEP_TIMEOUT).unwrap() {
                        steps += 1;
                    }
                    steps
                })
            };

            // Give the runner time to park at the barrier, then leave; the
            // leave must fire the pending advancement.
            std::thread::sleep(Duration::from_millis(50));
            clock.leave().unwrap();

            assert_eq!(runner.join().unwrap(), 3);
        });
    }

    #[test]
    fn abort_releases_waiters_with_an_error() {
        let clock = Arc::new(counting_clock(2, 100));

        std::thread::scope(|scope| {
            let waiter = {
                let clock = Arc::clone(&clock);
                scope.spawn(move || clock.sync(STEP_TIMEOUT))
            };
            std::thread::sleep(Duration::from_millis(50));
            clock.abort("equity kill");

            let result = waiter.join().unwrap();
            assert!(result.is_err(), "aborted waiters must see the failure");
        });
    }

    #[test]
    fn timeout_is_reported_not_fatal() {
        // Two participants, only one arrives.
        let clock = counting_clock(2, 10);
        let outcome = clock.sync(Duration::from_millis(50)).unwrap();
        assert_eq!(outcome, SyncOutcome::Timeout);
    }

    #[test]
    fn advancement_error_propagates_to_every_participant() {
        let clock = Arc::new(ReplayClock::new(
            2,
            Box::new(|| Err(RuntimeError::Aborted("boom".to_string()).into())),
        ));

        std::thread::scope(|scope| {
            let a = {
                let clock = Arc::clone(&clock);
                scope.spawn(move || clock.sync(STEP_TIMEOUT))
            };
            let b = {
                let clock = Arc::clone(&clock);
                scope.spawn(move || clock.sync(STEP_TIMEOUT))
            };
            let results = [a.join().unwrap(), b.join().unwrap()];
            assert!(results.iter().all(|r| r.is_err()));
        });
    }
}
