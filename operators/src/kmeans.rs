//! The k-means operator.
//!
//! Accumulates every input point into a shared
//! [`ParallelChunkedStorage`], samples the initial cluster centers with
//! per-worker reservoirs merged by a leader, then alternates between
//! re-associating points with their nearest center and recalculating the
//! centers as the means of their members, all expressed as ExtraWork
//! sub-steps of the runtime's phase machine. The Process phase streams every
//! labeled point to the output.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use udo_reservoir::Reservoir;
use udo_runtime::{
    random_seed,
    sync::{AtomicList, LeaderCell},
    ExecutionState, Operator, EXTRA_WORK_DONE,
};
use udo_storage::{LocalStorageRef, ParallelChunkedStorage, ParallelIterMut};

/// An input point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointTuple {
    /// The x coordinate.
    pub x: f64,
    /// The y coordinate.
    pub y: f64,
    /// Opaque payload carried through to the output.
    pub payload: u64,
}

/// An output point, labeled with the cluster it was assigned to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusteredTuple {
    /// The x coordinate.
    pub x: f64,
    /// The y coordinate.
    pub y: f64,
    /// Opaque payload carried through from the input.
    pub payload: u64,
    /// The id of the nearest cluster center.
    pub cluster_id: u16,
}

/// A cluster center.
#[derive(Clone, Copy, Default)]
struct Center {
    x: f64,
    y: f64,
}

/// A per-worker accumulator for one cluster's members.
#[derive(Clone, Copy, Default)]
struct LocalCenter {
    num_points: u64,
    x: f64,
    y: f64,
}

/// The per-worker state of the Input phase: the worker's slice of the tuple
/// storage and its reservoir of candidate centers.
struct ConsumeState {
    tuples: LocalStorageRef<ClusteredTuple>,
    sample: Reservoir<*mut ClusteredTuple>,
}

// SAFETY: the sampled pointers reference tuples in the operator's storage,
// which outlives the node; handing the node to the draining leader is a
// plain ownership transfer
unsafe impl Send for ConsumeState {}

/// The sub-steps of the ExtraWork phase. `Prepare*` steps elect a leader to
/// set up shared state, the work steps drain the tuple storage chunk by
/// chunk, and `Finish*` steps fold per-worker results and pick what follows.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
enum Step {
    PrepareInitializeClusters = 0,
    FinishInitializeClusters,
    PrepareAssociatePoints,
    AssociatePoints,
    FinishAssociatePoints,
    PrepareRecalculateMeans,
    RecalculateMeans,
    FinishRecalculateMeans,
    PrepareWriteOutput,
}

impl Step {
    fn from_u32(step: u32) -> Step {
        match step {
            0 => Step::PrepareInitializeClusters,
            1 => Step::FinishInitializeClusters,
            2 => Step::PrepareAssociatePoints,
            3 => Step::AssociatePoints,
            4 => Step::FinishAssociatePoints,
            5 => Step::PrepareRecalculateMeans,
            6 => Step::RecalculateMeans,
            7 => Step::FinishRecalculateMeans,
            8 => Step::PrepareWriteOutput,
            _ => unreachable!("invalid k-means sub-step {step}"),
        }
    }
}

/// The number of associate/recalculate rounds before the output is written.
const MAX_ITERATIONS: u32 = 10;

fn squared_distance(x: f64, y: f64, center: Center) -> f64 {
    let dx = center.x - x;
    let dy = center.y - y;
    dx * dx + dy * dy
}

/// The k-means operator. See the module documentation for the phase
/// structure.
///
/// Aborts the process when fewer points than clusters arrive; the
/// computation has no defined result in that case.
pub struct KMeans {
    num_clusters: usize,
    /// The snapshot iterator the work steps pull chunks from. Replaced by
    /// the leader of every `Prepare*` step. Declared before `tuples` so it
    /// drops first.
    tuples_iter: LeaderCell<ParallelIterMut<'static, ClusteredTuple>>,
    /// Every input tuple, labeled with its current cluster.
    tuples: LeaderCell<ParallelChunkedStorage<ClusteredTuple>>,
    /// Total number of input tuples; written by the initialization leader.
    num_tuples: AtomicUsize,
    /// The per-worker states collected during the Input phase.
    consume_states: AtomicList<ConsumeState>,
    /// The current cluster centers.
    centers: LeaderCell<Vec<Center>>,
    /// The per-worker accumulators of the RecalculateMeans step.
    local_centers: AtomicList<Vec<LocalCenter>>,
    /// The leader election flag of the current sub-step.
    prepare_flag: AtomicBool,
    /// The number of completed recalculation rounds.
    iterations: AtomicU32,
    /// How many points changed their cluster in the last associate round.
    changed_points: AtomicUsize,
}

impl Default for KMeans {
    fn default() -> Self {
        Self::new(8)
    }
}

impl Operator for KMeans {
    type Input = PointTuple;
    type Output = ClusteredTuple;

    const HAS_EXTRA_WORK: bool = true;

    fn accept(&self, exec: &mut ExecutionState<ClusteredTuple>, input: &PointTuple) {
        let mut state = exec.local_state().get_ptr::<ConsumeState>();
        if state.is_null() {
            // SAFETY: registration is safe under concurrency; exclusive
            // access to the storage is only ever taken by sub-step leaders,
            // which cannot run during the Input phase
            let tuples = unsafe { self.tuples.get() };
            state = self.consume_states.push(ConsumeState {
                tuples: tuples.create_local_storage(exec.thread_id()),
                sample: Reservoir::new(self.num_clusters, random_seed()),
            });
            exec.local_state().set_ptr(state);
        }
        // SAFETY: this worker pushed the node and the list is drained only
        // after the Input phase barrier
        let state = unsafe { &mut *state };

        let stored = state.tuples.push(ClusteredTuple {
            x: input.x,
            y: input.y,
            payload: input.payload,
            cluster_id: 0,
        });
        state.sample.offer(stored as *mut ClusteredTuple);
    }

    fn extra_work(&self, exec: &mut ExecutionState<ClusteredTuple>, step: u32) -> u32 {
        match Step::from_u32(step) {
            Step::PrepareInitializeClusters => self.prepare_initialize_clusters(),
            Step::FinishInitializeClusters => self.finish_initialize_clusters(),
            Step::PrepareAssociatePoints => self.prepare_associate_points(),
            Step::AssociatePoints => self.associate_points(exec),
            Step::FinishAssociatePoints => self.finish_associate_points(),
            Step::PrepareRecalculateMeans => self.prepare_recalculate_means(),
            Step::RecalculateMeans => self.recalculate_means(exec),
            Step::FinishRecalculateMeans => self.finish_recalculate_means(),
            Step::PrepareWriteOutput => self.prepare_write_output(),
        }
    }

    fn process(&self, exec: &mut ExecutionState<ClusteredTuple>) -> bool {
        // SAFETY: the snapshot was written by the PrepareWriteOutput leader,
        // ordered before this read by the phase barrier
        let iter = unsafe { self.tuples_iter.get() };
        if let Some(range) = iter.next(exec.thread_id()) {
            for tuple in range.as_slice() {
                exec.emit(*tuple);
            }
            false
        } else {
            true
        }
    }
}

impl KMeans {
    /// Creates a k-means operator computing `num_clusters` clusters.
    pub fn new(num_clusters: usize) -> Self {
        assert!(num_clusters > 0, "k-means needs at least one cluster");
        Self {
            num_clusters,
            tuples_iter: LeaderCell::new(ParallelIterMut::default()),
            tuples: LeaderCell::new(ParallelChunkedStorage::new()),
            num_tuples: AtomicUsize::new(0),
            consume_states: AtomicList::new(),
            centers: LeaderCell::new(vec![Center::default(); num_clusters]),
            local_centers: AtomicList::new(),
            prepare_flag: AtomicBool::new(false),
            iterations: AtomicU32::new(0),
            changed_points: AtomicUsize::new(0),
        }
    }

    /// The number of clusters this operator computes.
    pub fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    /// The number of input tuples counted during initialization. Only
    /// meaningful after a run.
    pub fn num_tuples(&self) -> usize {
        self.num_tuples.load(Ordering::Relaxed)
    }

    /// The cluster centers after a run.
    pub fn centers(&mut self) -> Vec<(f64, f64)> {
        self.centers
            .as_mut()
            .iter()
            .map(|center| (center.x, center.y))
            .collect()
    }

    /// Elects a leader that merges the per-worker reservoirs and turns the
    /// merged sample into the initial cluster centers.
    fn prepare_initialize_clusters(&self) -> u32 {
        if !self.prepare_flag.swap(true, Ordering::AcqRel) {
            let mut num_tuples = 0;
            let mut merged = Reservoir::new(self.num_clusters, 0);
            for state in self.consume_states.drain() {
                num_tuples += state.tuples.len();
                state.sample.merge_into(&mut merged);
            }
            self.num_tuples.store(num_tuples, Ordering::Relaxed);

            if num_tuples < self.num_clusters {
                log::error!(
                    "k-means received {num_tuples} points for {} clusters, aborting",
                    self.num_clusters
                );
                std::process::abort();
            }

            // SAFETY: the flag elected this worker; the write is published
            // to the other workers by the next barrier
            let centers = unsafe { self.centers.get_mut() };
            for (center, &sampled) in centers.iter_mut().zip(merged.sample()) {
                // SAFETY: sampled pointers reference tuples in self.tuples,
                // which are stable and alive for the whole run
                let point = unsafe { &*sampled };
                center.x = point.x;
                center.y = point.y;
            }
        }
        Step::FinishInitializeClusters as u32
    }

    fn finish_initialize_clusters(&self) -> u32 {
        self.prepare_flag.store(false, Ordering::Release);
        Step::PrepareAssociatePoints as u32
    }

    /// Elects a leader that resets the change counter and snapshots a fresh
    /// chunk iterator for the associate step.
    fn prepare_associate_points(&self) -> u32 {
        if !self.prepare_flag.swap(true, Ordering::AcqRel) {
            self.changed_points.store(0, Ordering::Relaxed);
            // SAFETY: the flag elected this worker; nobody else touches the
            // storage or the iterator until the barrier after this sub-step,
            // and the previous snapshot is exhausted
            unsafe {
                *self.tuples_iter.get_mut() = self.tuples.get_mut().parallel_iter_mut().detach();
            }
        }
        Step::AssociatePoints as u32
    }

    /// Claims one chunk and relabels its points with their nearest center.
    fn associate_points(&self, exec: &mut ExecutionState<ClusteredTuple>) -> u32 {
        // SAFETY: snapshot and centers were written by sub-step leaders,
        // ordered before this read by the barrier
        let (iter, centers) = unsafe { (self.tuples_iter.get(), self.centers.get()) };
        let Some(mut range) = iter.next(exec.thread_id()) else {
            return Step::FinishAssociatePoints as u32;
        };

        let mut changed = 0;
        for tuple in range.as_mut_slice() {
            let mut best = 0u16;
            let mut best_distance = squared_distance(tuple.x, tuple.y, centers[0]);
            for (i, &center) in centers.iter().enumerate().skip(1) {
                let distance = squared_distance(tuple.x, tuple.y, center);
                if distance < best_distance {
                    best = i as u16;
                    best_distance = distance;
                }
            }
            if best != tuple.cluster_id {
                tuple.cluster_id = best;
                changed += 1;
            }
        }
        self.changed_points.fetch_add(changed, Ordering::Relaxed);
        Step::AssociatePoints as u32
    }

    fn finish_associate_points(&self) -> u32 {
        self.prepare_flag.store(false, Ordering::Release);
        if self.iterations.load(Ordering::Relaxed) == MAX_ITERATIONS {
            Step::PrepareWriteOutput as u32
        } else {
            Step::PrepareRecalculateMeans as u32
        }
    }

    fn prepare_recalculate_means(&self) -> u32 {
        if !self.prepare_flag.swap(true, Ordering::AcqRel) {
            // SAFETY: as in prepare_associate_points
            unsafe {
                *self.tuples_iter.get_mut() = self.tuples.get_mut().parallel_iter_mut().detach();
            }
            self.iterations.fetch_add(1, Ordering::Relaxed);
        }
        Step::RecalculateMeans as u32
    }

    /// Claims one chunk and accumulates its points into this worker's
    /// per-cluster sums.
    fn recalculate_means(&self, exec: &mut ExecutionState<ClusteredTuple>) -> u32 {
        let mut local = exec.local_state().get_ptr::<Vec<LocalCenter>>();
        if local.is_null() {
            local = self
                .local_centers
                .push(vec![LocalCenter::default(); self.num_clusters]);
            exec.local_state().set_ptr(local);
        }
        // SAFETY: this worker pushed the node and the list is drained only
        // in the finish sub-step, after the barrier
        let local = unsafe { &mut *local };

        // SAFETY: snapshot written by the sub-step leader, barrier-ordered
        let iter = unsafe { self.tuples_iter.get() };
        let Some(range) = iter.next(exec.thread_id()) else {
            return Step::FinishRecalculateMeans as u32;
        };

        for tuple in range.as_slice() {
            let center = &mut local[tuple.cluster_id as usize];
            center.num_points += 1;
            center.x += tuple.x;
            center.y += tuple.y;
        }
        Step::RecalculateMeans as u32
    }

    /// The first worker to drain the accumulator list folds it and writes
    /// the new centers; everyone else passes through.
    fn finish_recalculate_means(&self) -> u32 {
        let drained = self.local_centers.drain();
        if drained.is_empty() {
            return Step::PrepareAssociatePoints as u32;
        }
        self.prepare_flag.store(false, Ordering::Release);

        let mut merged = vec![LocalCenter::default(); self.num_clusters];
        for local in drained {
            for (into, from) in merged.iter_mut().zip(&local) {
                into.num_points += from.num_points;
                into.x += from.x;
                into.y += from.y;
            }
        }

        // SAFETY: draining the list elected this worker; the write is
        // published by the barrier after this sub-step
        let centers = unsafe { self.centers.get_mut() };
        for (center, sum) in centers.iter_mut().zip(&merged) {
            center.x = sum.x / sum.num_points as f64;
            center.y = sum.y / sum.num_points as f64;
        }
        Step::PrepareAssociatePoints as u32
    }

    fn prepare_write_output(&self) -> u32 {
        if !self.prepare_flag.swap(true, Ordering::AcqRel) {
            self.iterations.fetch_add(1, Ordering::Relaxed);
            // SAFETY: as in prepare_associate_points
            unsafe {
                *self.tuples_iter.get_mut() = self.tuples.get_mut().parallel_iter_mut().detach();
            }
        }
        EXTRA_WORK_DONE
    }
}
