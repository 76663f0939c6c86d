//! Low-level building blocks: deterministic randomness, flat-array I/O, and
//! read-only file mappings.

/// Flat-array writers.
pub mod io;
pub mod mmap;
pub mod rng;

pub use mmap::MappedArray;
pub use rng::{mix_seed, XorShift128Plus};
