//! Minibatch neighbor sampling and per-batch computation graphs.

/// Single-node edge sampling and negative draws.
pub mod sampler;
/// Multi-hop subgraph construction.
pub mod subgraph;

pub use sampler::{sample_negative, sample_neighbors};
pub use subgraph::{build_subgraph, BatchSubgraph, LayerIndex, LayerSamples};
