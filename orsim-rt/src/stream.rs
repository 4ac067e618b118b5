//! Random-value streams for the pseudo traffic generators.
//!
//! Request sizes and think times are drawn from injected streams, so
//! the concrete distribution is a collaborator: the scheduler only
//! ever asks for "the next value".

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A stream of values, produced one at a time on demand.
pub trait ValueStream {
    /// Return the next value of this stream.
    fn next_value(&mut self) -> f64;
}

/// A stream that always produces the same value.
pub struct ConstantStream {
    /// The value to produce.
    value: f64,
}

impl ConstantStream {
    /// Create a stream that always produces `value`.
    pub fn new(value: f64) -> Self {
        ConstantStream { value }
    }
}

impl ValueStream for ConstantStream {
    fn next_value(&mut self) -> f64 {
        self.value
    }
}

/// A stream of values drawn uniformly from `[low, high)`.
pub struct UniformStream {
    /// Lower bound, inclusive.
    low: f64,
    /// Upper bound, exclusive.
    high: f64,
    /// Source of randomness.
    rng: StdRng,
}

impl UniformStream {
    /// Create a uniform stream over `[low, high)` with a fixed seed.
    ///
    /// Streams are always seeded explicitly: the simulator is
    /// deterministic, and a run is replayed by reusing its seeds.
    pub fn from_seed(low: f64, high: f64, seed: u64) -> Self {
        UniformStream {
            low,
            high,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ValueStream for UniformStream {
    fn next_value(&mut self) -> f64 {
        self.rng.gen_range(self.low..self.high)
    }
}
