use crate::primitives::XorShift128Plus;
use crate::storage::CsrGraph;
use crate::types::{NodeId, RelId, INVALID_NODE};

/// Appends `fanout` out-edges of `node`, drawn uniformly with replacement,
/// to `out_nodes`/`out_rels`. Returns the number of edges appended.
///
/// Nodes without out-edges (including out-of-range ids) and `fanout == 0`
/// append nothing and consume no randomness.
pub fn sample_neighbors(
    graph: &CsrGraph,
    node: NodeId,
    fanout: usize,
    out_nodes: &mut Vec<NodeId>,
    out_rels: &mut Vec<RelId>,
    rng: &mut XorShift128Plus,
) -> usize {
    let adj = graph.neighbors(node);
    if adj.is_empty() || fanout == 0 {
        return 0;
    }
    out_nodes.reserve(fanout);
    out_rels.reserve(fanout);
    let size = adj.size() as u32;
    for _ in 0..fanout {
        let (dst, rel) = adj.edge(rng.next_bounded(size) as usize);
        out_nodes.push(dst);
        out_rels.push(rel);
    }
    fanout
}

/// Uniform node id in `1..=num_nodes`.
///
/// The draw may equal the true tail of the triple being corrupted, and
/// repeated draws may collide; callers needing strict negatives filter.
/// Returns [`INVALID_NODE`] for an empty graph.
#[inline]
pub fn sample_negative(num_nodes: u32, rng: &mut XorShift128Plus) -> NodeId {
    if num_nodes == 0 {
        return INVALID_NODE;
    }
    rng.next_bounded(num_nodes) + 1
}
