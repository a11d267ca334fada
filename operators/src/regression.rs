//! The linear regression operator.
//!
//! Fits `y = a + bx + cx^2` to the input points by least squares. Setting
//! the partial derivatives of the squared error to zero gives the normal
//! equations
//!
//! ```text
//! | Σ1    Σx    Σx²  |   | a |   | Σy    |
//! | Σx    Σx²   Σx³  | * | b | = | Σxy   |
//! | Σx²   Σx³   Σx⁴  |   | c |   | Σx²y  |
//! ```
//!
//! whose closed-form solution only needs the eight sums on the left and
//! right hand sides. Every sum distributes over the input, so each worker
//! accumulates its own partial sums during the Input phase and a single
//! worker folds them, inverts the 3x3 system, and emits the coefficients.

use std::sync::atomic::{AtomicBool, Ordering};

use udo_runtime::{sync::AtomicList, ExecutionState, Operator};

/// An input sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleTuple {
    /// The value of x.
    pub x: f64,
    /// The measurement of y to fit.
    pub y: f64,
}

/// The fitted coefficients of `y = a + bx + cx^2`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoefficientsTuple {
    /// The constant term.
    pub a: f64,
    /// The linear coefficient.
    pub b: f64,
    /// The quadratic coefficient.
    pub c: f64,
}

/// One worker's partial sums, padded to a cache line so concurrent
/// accumulation never shares one.
#[derive(Default)]
#[repr(align(64))]
struct PartialSums {
    sum1: f64,
    sum_x: f64,
    sum_x2: f64,
    sum_x3: f64,
    sum_x4: f64,
    sum_y: f64,
    sum_xy: f64,
    sum_x2y: f64,
}

impl PartialSums {
    fn fold(&mut self, other: &PartialSums) {
        self.sum1 += other.sum1;
        self.sum_x += other.sum_x;
        self.sum_x2 += other.sum_x2;
        self.sum_x3 += other.sum_x3;
        self.sum_x4 += other.sum_x4;
        self.sum_y += other.sum_y;
        self.sum_xy += other.sum_xy;
        self.sum_x2y += other.sum_x2y;
    }
}

/// The linear regression operator. Emits exactly one output tuple.
#[derive(Default)]
pub struct LinearRegression {
    partial_sums: AtomicList<PartialSums>,
    result_taken: AtomicBool,
}

impl Operator for LinearRegression {
    type Input = SampleTuple;
    type Output = CoefficientsTuple;

    fn accept(&self, exec: &mut ExecutionState<CoefficientsTuple>, input: &SampleTuple) {
        let mut sums = exec.local_state().get_ptr::<PartialSums>();
        if sums.is_null() {
            sums = self.partial_sums.push(PartialSums::default());
            exec.local_state().set_ptr(sums);
        }
        // SAFETY: this worker pushed the node and the list is drained only
        // in the Process phase, after the barrier
        let sums = unsafe { &mut *sums };

        let x = input.x;
        let y = input.y;
        let x2 = x * x;

        sums.sum1 += 1.0;
        sums.sum_x += x;
        sums.sum_x2 += x2;
        sums.sum_x3 += x2 * x;
        sums.sum_x4 += x2 * x2;
        sums.sum_y += y;
        sums.sum_xy += x * y;
        sums.sum_x2y += x2 * y;
    }

    fn process(&self, exec: &mut ExecutionState<CoefficientsTuple>) -> bool {
        if self.result_taken.swap(true, Ordering::Relaxed) {
            return true;
        }

        let mut sums = PartialSums::default();
        for partial in self.partial_sums.drain() {
            sums.fold(&partial);
        }

        let det_inv = 1.0
            / (sums.sum1 * sums.sum_x2 * sums.sum_x4
                + 2.0 * sums.sum_x * sums.sum_x2 * sums.sum_x3
                - sums.sum_x2 * sums.sum_x2 * sums.sum_x2
                - sums.sum1 * sums.sum_x3 * sums.sum_x3
                - sums.sum_x * sums.sum_x * sums.sum_x4);
        let a = det_inv
            * (sums.sum_y * (sums.sum_x2 * sums.sum_x4 - sums.sum_x3 * sums.sum_x3)
                + sums.sum_xy * (sums.sum_x2 * sums.sum_x3 - sums.sum_x * sums.sum_x4)
                + sums.sum_x2y * (sums.sum_x * sums.sum_x3 - sums.sum_x2 * sums.sum_x2));
        let b = det_inv
            * (sums.sum_y * (sums.sum_x2 * sums.sum_x3 - sums.sum_x * sums.sum_x4)
                + sums.sum_xy * (sums.sum1 * sums.sum_x4 - sums.sum_x2 * sums.sum_x2)
                + sums.sum_x2y * (sums.sum_x * sums.sum_x2 - sums.sum1 * sums.sum_x3));
        let c = det_inv
            * (sums.sum_y * (sums.sum_x * sums.sum_x3 - sums.sum_x2 * sums.sum_x2)
                + sums.sum_xy * (sums.sum_x * sums.sum_x2 - sums.sum1 * sums.sum_x3)
                + sums.sum_x2y * (sums.sum1 * sums.sum_x2 - sums.sum_x * sums.sum_x));

        exec.emit(CoefficientsTuple { a, b, c });
        true
    }
}
