//! Fixed-capacity uniform random sampling over a stream of unknown length.
//!
//! [`Reservoir`] implements Li's Algorithm L (<https://doi.org/10.1145/198429.198435>):
//! instead of drawing a random number per candidate, it draws geometric skip
//! lengths, so feeding is O(k (1 + log(n/k))) random draws for n candidates.
//! Partial samples produced by independent workers can be combined with
//! [`Reservoir::merge_into`], which preserves uniformity across arbitrary
//! partitionings of the input.
#![warn(missing_docs)]

use rand::{rngs::SmallRng, Rng, SeedableRng};

/// A fixed-capacity uniform random sample of a stream.
///
/// After feeding `n >= k` candidates with [`offer`](Reservoir::offer), the
/// buffer holds a uniform random `k`-subset of them; for `n < k` it holds all
/// candidates in feed order.
pub struct Reservoir<T> {
    /// The sampled items; holds at most `capacity` items.
    sample: Vec<T>,
    /// The sample capacity `k`.
    capacity: usize,
    /// The number of candidates fed or accounted for by merges.
    seen: u64,
    rng: SmallRng,
    /// The running `W` of Algorithm L.
    w: f64,
    /// The number of upcoming candidates to reject before the next
    /// replacement.
    skip: u64,
}

impl<T> Reservoir<T> {
    /// Creates an empty reservoir with the given capacity, seeding its
    /// internal generator from `seed`.
    pub fn new(capacity: usize, seed: u64) -> Self {
        assert!(capacity > 0, "reservoir capacity must be positive");
        let mut rng = SmallRng::seed_from_u64(seed);
        let w = (rng.gen::<f64>().ln() / capacity as f64).exp();
        let skip = (rng.gen::<f64>().ln() / (1.0 - w).ln()).floor() as u64;
        Self {
            sample: Vec::with_capacity(capacity),
            capacity,
            seen: 0,
            rng,
            w,
            skip,
        }
    }

    /// The sample capacity `k`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of candidates this sample accounts for.
    pub fn elements_seen(&self) -> u64 {
        self.seen
    }

    /// The current sample contents.
    pub fn sample(&self) -> &[T] {
        &self.sample
    }

    /// Consumes the reservoir, returning the sample buffer.
    pub fn into_sample(self) -> Vec<T> {
        self.sample
    }

    /// Feeds one candidate.
    pub fn offer(&mut self, item: T) {
        self.seen += 1;
        if self.sample.len() < self.capacity {
            self.sample.push(item);
            return;
        }
        if self.skip > 0 {
            self.skip -= 1;
            return;
        }
        let k = self.capacity as f64;
        self.w *= (self.rng.gen::<f64>().ln() / k).exp();
        self.skip = (self.rng.gen::<f64>().ln() / (1.0 - self.w).ln()).floor() as u64;
        let slot = self.rng.gen_range(0..self.capacity);
        self.sample[slot] = item;
    }

    /// Merges this sample into `target` so that the result is a uniform
    /// sample of both underlying streams combined.
    ///
    /// Merging does not reset the target's skip state; a merged reservoir is
    /// a result, not a feed target.
    ///
    /// # Panics
    /// Panics in debug builds when the capacities differ.
    pub fn merge_into(mut self, target: &mut Self) {
        debug_assert_eq!(self.capacity, target.capacity);
        if self.seen == 0 {
            return;
        }
        let k = self.capacity;

        // Two partial samples: top up the target with the source's items,
        // each of which stands for exactly one candidate.
        if target.sample.len() < k && self.sample.len() < k {
            let copy = (k - target.sample.len()).min(self.sample.len());
            for item in self.sample.drain(..copy) {
                target.sample.push(item);
            }
            target.seen += copy as u64;
            self.seen -= copy as u64;
            if self.seen == 0 {
                return;
            }
        }

        if target.sample.len() < k {
            // Source full, target partial: fold the target's items into the
            // source as fresh candidates (Algorithm R), then hand the
            // source's buffer to the target to preserve its identity.
            let partial = std::mem::take(&mut target.sample);
            for (i, item) in partial.into_iter().enumerate() {
                let slot = self.rng.gen_range(0..=self.seen + i as u64);
                if (slot as usize) < k {
                    self.sample[slot as usize] = item;
                }
            }
            target.sample = std::mem::take(&mut self.sample);
            target.seen += self.seen;
        } else if self.sample.len() < k {
            // Source partial, target full: ordinary reservoir insertion of
            // the source's items.
            let count = self.sample.len() as u64;
            for (i, item) in self.sample.drain(..).enumerate() {
                let slot = self.rng.gen_range(0..=target.seen + i as u64);
                if (slot as usize) < k {
                    target.sample[slot as usize] = item;
                }
            }
            target.seen += count;
        } else {
            // Both full: per-slot lottery weighted by the number of
            // candidates each side has seen.
            let total = self.seen + target.seen;
            let source_seen = self.seen;
            for (i, item) in self.sample.drain(..).enumerate() {
                if self.rng.gen_range(1..=total) <= source_seen {
                    target.sample[i] = item;
                }
            }
            target.seen += source_seen;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_everything_below_capacity() {
        let mut reservoir = Reservoir::new(8, 1);
        for i in 0..5u32 {
            reservoir.offer(i);
        }
        assert_eq!(reservoir.elements_seen(), 5);
        assert_eq!(reservoir.sample(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn sample_size_is_capped() {
        let mut reservoir = Reservoir::new(8, 2);
        for i in 0..10_000u32 {
            reservoir.offer(i);
        }
        assert_eq!(reservoir.sample().len(), 8);
        assert_eq!(reservoir.elements_seen(), 10_000);
    }

    /// Selection frequencies over many independently seeded runs. Used as a
    /// χ² statistic against the uniform expectation.
    fn selection_histogram(
        num_items: u32,
        runs: u64,
        feed: impl Fn(u64) -> Reservoir<u32>,
    ) -> Vec<u64> {
        let mut histogram = vec![0u64; num_items as usize];
        for run in 0..runs {
            let reservoir = feed(run);
            assert_eq!(reservoir.elements_seen(), num_items as u64);
            for &item in reservoir.sample() {
                histogram[item as usize] += 1;
            }
        }
        histogram
    }

    fn chi_squared(histogram: &[u64], expected: f64) -> f64 {
        histogram
            .iter()
            .map(|&observed| {
                let d = observed as f64 - expected;
                d * d / expected
            })
            .sum()
    }

    /// Feeding N items yields each item with probability K/N. χ² over the
    /// per-item selection counts; 2N is far beyond any plausible quantile
    /// for N - 1 degrees of freedom.
    #[test]
    fn uniform_selection() {
        const N: u32 = 50;
        const K: usize = 10;
        const RUNS: u64 = 4000;

        let histogram = selection_histogram(N, RUNS, |run| {
            let mut reservoir = Reservoir::new(K, 0xbead + run);
            for i in 0..N {
                reservoir.offer(i);
            }
            reservoir
        });
        let expected = RUNS as f64 * K as f64 / N as f64;
        assert!(chi_squared(&histogram, expected) < 2.0 * N as f64);
    }

    /// Merging two reservoirs fed the halves of a stream selects items with
    /// the same per-item probability as feeding the whole stream directly.
    #[test]
    fn merge_preserves_uniformity() {
        const N: u32 = 50;
        const K: usize = 10;
        const RUNS: u64 = 4000;

        for split in [5, 25, 45] {
            let histogram = selection_histogram(N, RUNS, |run| {
                let mut left = Reservoir::new(K, 0x1ef7 + 2 * run);
                let mut right = Reservoir::new(K, 0x2137 + 2 * run);
                for i in 0..split {
                    left.offer(i);
                }
                for i in split..N {
                    right.offer(i);
                }
                left.merge_into(&mut right);
                right
            });
            let expected = RUNS as f64 * K as f64 / N as f64;
            assert!(chi_squared(&histogram, expected) < 2.0 * N as f64);
        }
    }

    /// Merging into a partial target keeps every item when the total fits.
    #[test]
    fn merge_of_small_samples_keeps_everything() {
        let mut a = Reservoir::new(8, 3);
        let mut b = Reservoir::new(8, 4);
        for i in 0..3u32 {
            a.offer(i);
        }
        for i in 3..7u32 {
            b.offer(i);
        }
        a.merge_into(&mut b);
        assert_eq!(b.elements_seen(), 7);
        let mut sample = b.into_sample();
        sample.sort_unstable();
        assert_eq!(sample, (0..7).collect::<Vec<_>>());
    }

    /// The full/partial swap path preserves the candidate count and yields a
    /// full sample.
    #[test]
    fn merge_full_into_partial() {
        let mut full = Reservoir::new(8, 5);
        for i in 0..1000u32 {
            full.offer(i);
        }
        let mut partial = Reservoir::new(8, 6);
        for i in 1000..1003u32 {
            partial.offer(i);
        }
        full.merge_into(&mut partial);
        assert_eq!(partial.elements_seen(), 1003);
        assert_eq!(partial.sample().len(), 8);
    }
}
