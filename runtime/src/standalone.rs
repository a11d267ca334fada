use std::sync::{
    atomic::{AtomicU64, Ordering},
    Condvar, Mutex,
};

use udo_storage::{ChunkedStorage, ParallelChunkedStorage, ParallelIter};

use crate::{ExecutionState, Operator, EXTRA_WORK_DONE};

/// The phases every worker steps through. Transitions are barrier
/// synchronized; the packed phase word additionally carries the operator's
/// current ExtraWork sub-step in its low half.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Input,
    ExtraWork,
    Process,
    End,
}

impl Phase {
    fn of(info: u64) -> Phase {
        match (info >> 32) as u32 {
            0 => Phase::Input,
            1 => Phase::ExtraWork,
            2 => Phase::Process,
            _ => Phase::End,
        }
    }
}

fn pack(phase: Phase, step: u32) -> u64 {
    let phase = match phase {
        Phase::Input => 0u64,
        Phase::ExtraWork => 1,
        Phase::Process => 2,
        Phase::End => 3,
    };
    (phase << 32) | step as u64
}

/// The barrier that synchronizes phase and sub-step transitions.
///
/// The phase word is read lock-free in the worker loop and written only by
/// the last worker arriving at the barrier, under the mutex. No worker
/// observes the new phase until all workers have finished the old one.
struct PhaseBarrier {
    info: AtomicU64,
    waiting: Mutex<usize>,
    advanced: Condvar,
    num_threads: usize,
}

impl PhaseBarrier {
    fn new(num_threads: usize) -> Self {
        Self {
            info: AtomicU64::new(pack(Phase::Input, 0)),
            waiting: Mutex::new(0),
            advanced: Condvar::new(),
            num_threads,
        }
    }

    fn current(&self) -> u64 {
        self.info.load(Ordering::Acquire)
    }

    /// Waits for all workers to finish the phase word `current`; the last
    /// arrival publishes `next` and wakes the others.
    fn advance(&self, current: u64, next: u64) {
        let mut waiting = self.waiting.lock().unwrap();
        *waiting += 1;
        if *waiting == self.num_threads {
            *waiting = 0;
            self.info.store(next, Ordering::Release);
            self.advanced.notify_all();
        } else {
            while self.info.load(Ordering::Acquire) == current {
                waiting = self.advanced.wait(waiting).unwrap();
            }
        }
    }
}

/// Runs a user-defined operator on a pool of worker threads, outside of any
/// host system.
///
/// ```no_run
/// # use udo_runtime::{Operator, ExecutionState, Standalone};
/// # use udo_storage::ParallelChunkedStorage;
/// # struct Echo;
/// # impl Operator for Echo {
/// #     type Input = u64;
/// #     type Output = u64;
/// #     fn accept(&self, exec: &mut ExecutionState<u64>, input: &u64) {
/// #         exec.emit(*input);
/// #     }
/// # }
/// let input: ParallelChunkedStorage<u64> = ParallelChunkedStorage::new();
/// let standalone = Standalone::new(8, 10_000);
/// let output = standalone.run(&Echo, &input);
/// ```
pub struct Standalone {
    num_threads: usize,
    morsel_size: usize,
}

impl Standalone {
    /// Creates a coordinator running `num_threads` workers (0 is treated
    /// as 1). `morsel_size` is advisory: the chunk granularity of the input
    /// storage governs the units of work actually handed out.
    pub fn new(num_threads: usize, morsel_size: usize) -> Self {
        Self {
            num_threads: num_threads.max(1),
            morsel_size,
        }
    }

    /// The number of worker threads `run` will spawn.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// The advisory morsel size.
    pub fn morsel_size(&self) -> usize {
        self.morsel_size
    }

    /// Runs the operator over the given input and returns the merged output.
    ///
    /// Workers pull input chunks through the storage's parallel iterator and
    /// call `accept` for every tuple; once the input is exhausted a barrier
    /// moves everyone to the ExtraWork phase (if the operator has one) and
    /// then to Process. The input must not be mutated for the duration of
    /// the call.
    pub fn run<U: Operator>(
        &self,
        operator: &U,
        input: &ParallelChunkedStorage<U::Input>,
    ) -> ChunkedStorage<U::Output>
    where
        U::Input: Sync,
        U::Output: Send,
    {
        log::debug!("running operator on {} worker threads", self.num_threads);

        let barrier = PhaseBarrier::new(self.num_threads);
        let input_iter = input.parallel_iter();

        let outputs: Vec<ChunkedStorage<U::Output>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.num_threads)
                .map(|thread_id| {
                    let barrier = &barrier;
                    let input_iter = &input_iter;
                    scope.spawn(move || worker(operator, input_iter, barrier, thread_id as u32))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("worker thread panicked"))
                .collect()
        });

        let mut result = ChunkedStorage::new();
        for mut output in outputs {
            result.merge(&mut output);
        }
        result
    }
}

/// The worker loop: dispatch on the current phase word, propose the next
/// one, and synchronize at the barrier whenever the proposal differs.
fn worker<U: Operator>(
    operator: &U,
    input: &ParallelIter<'_, U::Input>,
    barrier: &PhaseBarrier,
    thread_id: u32,
) -> ChunkedStorage<U::Output> {
    let mut exec = ExecutionState::new(thread_id);

    loop {
        let current = barrier.current();
        let mut next = current;

        match Phase::of(current) {
            Phase::Input => {
                if let Some(range) = input.next(thread_id) {
                    for tuple in range.as_slice() {
                        operator.accept(&mut exec, tuple);
                    }
                } else if U::HAS_EXTRA_WORK {
                    next = pack(Phase::ExtraWork, 0);
                } else {
                    next = pack(Phase::Process, 0);
                }
            }

            Phase::ExtraWork => {
                let mut step = current as u32;
                if step != EXTRA_WORK_DONE {
                    step = operator.extra_work(&mut exec, step);
                }
                next = if step == EXTRA_WORK_DONE {
                    pack(Phase::Process, 0)
                } else {
                    pack(Phase::ExtraWork, step)
                };
            }

            Phase::Process => {
                while !operator.process(&mut exec) {}
                // A worker whose processing is done leaves directly; there
                // is no barrier between Process and End.
                return exec.into_output();
            }

            Phase::End => return exec.into_output(),
        }

        if next != current {
            exec.clear_local_state();
            barrier.advance(current, next);
        }
    }
}
