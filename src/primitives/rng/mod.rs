#![forbid(unsafe_code)]
//! Deterministic xorshift128+ generator shared by sampling, initialization,
//! and shuffling.

use rand::RngCore;

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;
const UNIT_SCALE: f64 = 1.0 / 9_007_199_254_740_992.0;

/// splitmix64 finalizer. Also used to derive per-node feature noise.
pub fn mix_seed(mut x: u64) -> u64 {
    x = x.wrapping_add(GOLDEN_GAMMA);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// xorshift128+ stream selected by `(seed, seq)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XorShift128Plus {
    s0: u64,
    s1: u64,
}

impl XorShift128Plus {
    /// Creates the stream `seq` of generator `seed`.
    pub fn new(seed: u64, seq: u64) -> Self {
        let s0 = mix_seed(seed);
        let mut s1 = mix_seed(seq.wrapping_add(GOLDEN_GAMMA));
        if (s0 | s1) == 0 {
            s1 = 1;
        }
        Self { s0, s1 }
    }

    /// Stream 0 of `seed`.
    pub fn from_seed(seed: u64) -> Self {
        Self::new(seed, 0)
    }

    /// Advances the state and returns 64 fresh bits.
    #[inline]
    pub fn next_word(&mut self) -> u64 {
        let mut x = self.s0;
        let y = self.s1;
        self.s0 = y;
        x ^= x << 23;
        self.s1 = x ^ y ^ (x >> 17) ^ (y >> 26);
        self.s1.wrapping_add(y)
    }

    /// Draw in `0..bound` by modulo reduction; `bound == 0` yields 0 without
    /// consuming state.
    #[inline]
    pub fn next_bounded(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        (self.next_word() % u64::from(bound)) as u32
    }

    /// Uniform float in `[0, 1)` built from the top 53 bits.
    #[inline]
    pub fn uniform(&mut self) -> f32 {
        let r = ((self.next_word() >> 11) as f64 * UNIT_SCALE) as f32;
        // narrowing can round the top of the range up to 1.0
        r.min(1.0 - f32::EPSILON / 2.0)
    }
}

impl Default for XorShift128Plus {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

impl RngCore for XorShift128Plus {
    fn next_u32(&mut self) -> u32 {
        (self.next_word() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next_word()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_word().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
