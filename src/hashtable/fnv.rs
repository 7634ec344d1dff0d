//! Bucket hashing for aggregate keys.
//!
//! Single scalar keys take the multiplicative integer hash fast path;
//! strings, compound tuples and stacktraces are hashed with FNV-1a over
//! their raw bytes. Every function folds its result down to `bits` bits
//! by keeping the high bits of the accumulator.

use core::hash::{BuildHasherDefault, Hasher};

use crate::trace_ops::StackTrace;

pub const FNV_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;
pub const FNV_PRIME: u64 = 1_099_511_628_211;

/// Multiplier of the 32-bit integer hash.
pub const GOLDEN_RATIO_PRIME_32: u32 = 0x9e37_0001;
/// Multiplier of the 64-bit integer hash.
pub const GOLDEN_RATIO_PRIME_64: u64 = 0x9e37_ffff_fffc_0001;

/// Streaming FNV-1a state.
///
/// Also serves as the [`Hasher`] behind [`FnvBuildHasher`].
#[derive(Debug, Clone, Copy)]
pub struct FnvHasher(u64);

impl FnvHasher {
    pub const fn new() -> Self {
        Self(FNV_OFFSET_BASIS)
    }

    #[inline]
    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    /// Full 64-bit accumulator.
    #[inline]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl Default for FnvHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        self.update(bytes);
    }
}

/// `BuildHasher` for hashbrown maps keyed by event names.
pub type FnvBuildHasher = BuildHasherDefault<FnvHasher>;

/// Keep the top `bits` bits of a 64-bit hash.
#[inline]
pub const fn fold(hash: u64, bits: u32) -> u64 {
    match bits {
        0 => 0,
        b if b >= 64 => hash,
        b => hash >> (64 - b),
    }
}

/// FNV-1a over `key`, folded to `bits` bits.
#[inline]
pub fn fnv_1a(key: &[u8], bits: u32) -> u64 {
    let mut h = FnvHasher::new();
    h.update(key);
    fold(h.value(), bits)
}

/// Integer hash for 32-bit keys.
#[inline]
pub const fn hash_32(val: u32, bits: u32) -> u64 {
    let h = val.wrapping_mul(GOLDEN_RATIO_PRIME_32);
    match bits {
        0 => 0,
        b if b >= 32 => h as u64,
        b => (h >> (32 - b)) as u64,
    }
}

/// Integer hash for 64-bit keys.
#[inline]
pub const fn hash_64(val: u64, bits: u32) -> u64 {
    fold(val.wrapping_mul(GOLDEN_RATIO_PRIME_64), bits)
}

/// FNV-1a over the captured frames, `nr_entries * size_of::<usize>()` bytes.
pub fn hash_stacktrace(trace: &StackTrace, bits: u32) -> u64 {
    let mut h = FnvHasher::new();
    for frame in trace.frames() {
        h.update(&frame.to_ne_bytes());
    }
    fold(h.value(), bits)
}

/// FNV-1a over the packed 64-bit values of a compound key.
pub fn hash_compound(vals: &[u64], bits: u32) -> u64 {
    let mut h = FnvHasher::new();
    for v in vals {
        h.update(&v.to_ne_bytes());
    }
    fold(h.value(), bits)
}
