//! Multi-phase data-parallel execution of user-defined operators (UDOs).
//!
//! An operator implements the [`Operator`] trait; the [`Standalone`]
//! coordinator drives a pool of worker threads through the operator's
//! phases (Input, optional ExtraWork sub-steps, Process) with a global
//! barrier between phases. Workers feed input tuples from a
//! [`ParallelChunkedStorage`](udo_storage::ParallelChunkedStorage) and emit
//! output tuples into per-worker
//! [`ChunkedStorage`](udo_storage::ChunkedStorage) sinks that the
//! coordinator splices into one result.
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(missing_docs)]

mod operator;
mod standalone;
pub mod sync;
mod tuple;

pub use operator::{ExecutionState, LocalState, Operator, EXTRA_WORK_DONE};
pub use standalone::Standalone;
pub use tuple::{EmptyTuple, TupleStr, INLINE_LEN};

/// Draws a seed from the process-local entropy source.
///
/// Operators use this to seed their per-worker generators.
pub fn random_seed() -> u64 {
    rand::random()
}

/// The number of worker threads to use by default: the parallelism available
/// to this process (on Linux, the population of the CPU affinity mask).
pub fn default_num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
