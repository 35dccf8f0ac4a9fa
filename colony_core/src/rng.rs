use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

/// Deterministic PRNG used throughout the engine.
///
/// A thin wrapper over `ChaCha8Rng` that pins down the two operations the
/// fuzzing code actually needs: a raw 64-bit draw and a bounded draw.
/// Seeds must be non-zero so that "unset" configuration is caught at
/// construction instead of silently producing the all-zero stream.
#[derive(Debug, Clone)]
pub struct Rng {
    inner: ChaCha8Rng,
}

impl Rng {
    /// Creates a new generator from a non-zero seed.
    ///
    /// # Panics
    /// Panics if `seed` is zero. Callers derive seeds with
    /// [`crate::util::get_random_seed`], which never returns zero.
    pub fn new(seed: u64) -> Self {
        assert_ne!(seed, 0, "RNG seed must not be zero");
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Returns the next 64-bit value.
    pub fn next(&mut self) -> u64 {
        self.inner.next_u64()
    }

    /// Returns a value in `0..n`.
    ///
    /// # Panics
    /// Panics if `n` is zero.
    pub fn below(&mut self, n: u64) -> u64 {
        assert_ne!(n, 0, "bounded draw requires n > 0");
        self.inner.next_u64() % n
    }

    /// Fisher-Yates shuffle of `items`.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i as u64 + 1) as usize;
            items.swap(i, j);
        }
    }
}
