//! Chunked tuple storage for the parallel UDO runtime.
//!
//! [`ChunkedStorage`] is an append-only container with stable element
//! references that allocates memory in geometrically growing chunks.
//! [`ParallelChunkedStorage`] bundles one `ChunkedStorage` per worker behind
//! a lock-free registration list and offers a snapshot iterator that hands
//! out whole chunks to concurrent callers, each chunk exactly once.
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(missing_docs)]

mod chunked;
mod parallel;

pub use chunked::{ChunkedStorage, Iter, IterMut};
pub use parallel::{
    LocalStorageRef, ParallelChunkedStorage, ParallelIter, ParallelIterMut, Range, RangeMut,
    StorageIter,
};
