//! Deterministic random number generation.
//!
//! The harness seeds every random draw from a single run seed so that any
//! recorded witness can be replayed bit-for-bit. Per-iteration streams are
//! forked from the run seed with a splitmix64-style mixer, which keeps
//! iteration outcomes independent of worker count and scheduling order.

/// Deterministic RNG with a splitmix64 mixer over a xorshift stream.
///
/// Not cryptographic. Stability of the output sequence for a given seed is
/// part of the reproducibility contract.
#[derive(Debug, Clone)]
pub struct DetRng {
    state: u64,
}

impl DetRng {
    /// Create a generator from a seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        // Avoid the all-zero fixed point of the xorshift step.
        Self {
            state: mix(seed ^ 0x9e37_79b9_7f4a_7c15),
        }
    }

    /// Next `u64` in the stream.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        mix(x)
    }

    /// Uniform draw in `0..bound`. Returns 0 when `bound` is 0.
    pub fn next_below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        // Modulo bias is acceptable here: bounds are tiny relative to 2^64
        // and the contract is determinism, not statistical quality.
        self.next_u64() % bound
    }

    /// Uniform draw in the inclusive range `min..=max`.
    pub fn next_in_range(&mut self, min: i64, max: i64) -> i64 {
        debug_assert!(min <= max);
        let span = max.wrapping_sub(min) as u64;
        if span == u64::MAX {
            return self.next_u64() as i64;
        }
        min.wrapping_add(self.next_below(span + 1) as i64)
    }

    /// Next boolean.
    pub fn next_bool(&mut self) -> bool {
        self.next_u64() & 1 == 1
    }

    /// Fill a buffer with deterministic bytes.
    pub fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Deterministically derive a child generator for a labeled stream.
    ///
    /// Forking by `(action name hash, iteration)` gives every iteration its
    /// own stream regardless of which worker runs it.
    #[must_use]
    pub fn fork(&self, label: u64, index: u64) -> Self {
        let mut child = self
            .state
            .wrapping_add(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(label.wrapping_mul(0x517c_c1b7_2722_0a95));
        child = child.wrapping_add(index);
        Self { state: mix(child) }
    }
}

/// Stable 64-bit hash of a string, used to label forked streams.
#[must_use]
pub fn label_hash(label: &str) -> u64 {
    // FNV-1a. Stable across platforms and releases, unlike DefaultHasher.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in label.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn mix(mut seed: u64) -> u64 {
    seed ^= seed >> 30;
    seed = seed.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    seed ^= seed >> 27;
    seed = seed.wrapping_mul(0x94d0_49bb_1331_11eb);
    seed ^= seed >> 31;
    seed
}
