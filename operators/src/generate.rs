//! Process-only operators that generate the benchmark inputs.
//!
//! Both generators consume no tuples: every `process` call claims a block of
//! work from an atomic counter, seeds a generator deterministically from the
//! block id, and emits its points. Two runs with the same parameters produce
//! the same multiset of points regardless of the thread count.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use udo_runtime::{EmptyTuple, ExecutionState, Operator};

/// A 2D point.
#[derive(Clone, Copy, Debug, Default)]
struct Point2D {
    x: f64,
    y: f64,
}

/// The fixed cluster centers. The trailing slots are unused: their point
/// proportion is zero.
const CLUSTER_CENTERS: [Point2D; 10] = [
    Point2D { x: 0.0, y: 0.0 },
    Point2D { x: 40.0, y: 0.0 },
    Point2D { x: 0.0, y: -40.0 },
    Point2D { x: -40.0, y: 0.0 },
    Point2D { x: 0.0, y: 40.0 },
    Point2D { x: 50.0, y: 44.0 },
    Point2D { x: 40.0, y: -80.0 },
    Point2D { x: -30.0, y: -50.0 },
    Point2D { x: 0.0, y: 0.0 },
    Point2D { x: 0.0, y: 0.0 },
];

/// The standard deviations for the clusters.
const STD_DEVS: [f64; 10] = [5.0, 5.0, 5.0, 5.0, 5.0, 7.0, 8.0, 1.0, 0.0, 0.0];

/// The proportion of points that should belong to each cluster.
const CLUSTER_PROPORTIONS: [f64; 10] = [
    1.0 / 8.0,
    1.0 / 8.0,
    1.0 / 8.0,
    1.0 / 8.0,
    1.0 / 8.0,
    1.0 / 64.0,
    1.0 / 64.0 * 15.0,
    1.0 / 8.0,
    0.0,
    0.0,
];

/// A generated 2D point with the id of the cluster it was drawn from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeneratedPoint {
    /// The x coordinate.
    pub x: f64,
    /// The y coordinate.
    pub y: f64,
    /// The id of the cluster this point belongs to.
    pub cluster_id: u32,
}

/// Generates random 2D points around the fixed cluster centers. Each
/// `process` call claims one whole cluster.
pub struct CreatePoints {
    num_points: u64,
    next_cluster_id: AtomicU32,
}

impl CreatePoints {
    /// Creates a generator producing approximately `num_points` points.
    pub fn new(num_points: u64) -> Self {
        Self {
            num_points,
            next_cluster_id: AtomicU32::new(0),
        }
    }
}

impl Operator for CreatePoints {
    type Input = EmptyTuple;
    type Output = GeneratedPoint;

    fn process(&self, exec: &mut ExecutionState<GeneratedPoint>) -> bool {
        let cluster_id = self.next_cluster_id.fetch_add(1, Ordering::Relaxed);
        if cluster_id as usize >= CLUSTER_CENTERS.len() {
            return true;
        }

        let mut rng = SmallRng::seed_from_u64(42 + cluster_id as u64);
        let center = CLUSTER_CENTERS[cluster_id as usize];
        let std_dev = STD_DEVS[cluster_id as usize];
        let x_dist = Normal::new(center.x, std_dev).expect("valid standard deviation");
        let y_dist = Normal::new(center.y, std_dev).expect("valid standard deviation");

        let num_cluster_points =
            (self.num_points as f64 * CLUSTER_PROPORTIONS[cluster_id as usize]).ceil() as u64;

        for _ in 0..num_cluster_points {
            exec.emit(GeneratedPoint {
                x: x_dist.sample(&mut rng),
                y: y_dist.sample(&mut rng),
                cluster_id,
            });
        }

        false
    }
}

/// A generated regression sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeneratedSample {
    /// The x value, uniform in `[0, 100)`.
    pub x: f64,
    /// The noisy measurement of `a + bx + cx^2`.
    pub y: f64,
}

/// The number of points one `process` call generates.
const SAMPLE_BLOCK: u64 = 10_000;

/// Generates random points on the curve `y = a + bx + cx^2 + e`, with `e`
/// normally distributed around zero with standard deviation `a + b + c`.
pub struct CreateRegressionPoints {
    a: f64,
    b: f64,
    c: f64,
    num_points: u64,
    points_counter: AtomicU64,
}

impl CreateRegressionPoints {
    /// Creates a generator for `num_points` samples of the given curve.
    pub fn new(a: f64, b: f64, c: f64, num_points: u64) -> Self {
        Self {
            a,
            b,
            c,
            num_points,
            points_counter: AtomicU64::new(0),
        }
    }
}

impl Operator for CreateRegressionPoints {
    type Input = EmptyTuple;
    type Output = GeneratedSample;

    fn process(&self, exec: &mut ExecutionState<GeneratedSample>) -> bool {
        let first_index = self.points_counter.fetch_add(SAMPLE_BLOCK, Ordering::Relaxed);
        if first_index >= self.num_points {
            return true;
        }

        let mut rng = SmallRng::seed_from_u64(42 + first_index);
        let std_dev = self.a + self.b + self.c;
        let error_dist = Normal::new(0.0, std_dev).expect("valid standard deviation");

        let count = SAMPLE_BLOCK.min(self.num_points - first_index);
        for _ in 0..count {
            let x = rng.gen_range(0.0..100.0);
            let e = error_dist.sample(&mut rng);
            let y = self.a + self.b * x + self.c * x * x + e;
            exec.emit(GeneratedSample { x, y });
        }

        false
    }
}
