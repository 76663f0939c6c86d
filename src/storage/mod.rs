//! Graph storage: the read-only CSR store, its writer, and triple files.
//!
//! Every array is a headerless little-endian flat file. The forward graph is
//! five arrays (`offsets`, `csr`, `rels`, `entities`, `props`); the reverse
//! graph reuses the first three with a `_rev` suffix.

/// CSR assembly from edge lists and reverse-graph construction.
pub mod builder;
/// Memory-mapped graph store.
pub mod graph;
/// Triple record files.
pub mod triples;

pub use builder::{build_reverse, CsrArrays, CsrBuilder, ReverseArrays};
pub use graph::{AdjView, CsrGraph, GraphFiles};
pub use triples::{write_triples, Triple, TripleFile};
