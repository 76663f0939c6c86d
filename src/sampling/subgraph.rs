use rustc_hash::FxHashMap;
use tracing::trace;

use super::sampler::sample_neighbors;
use crate::primitives::XorShift128Plus;
use crate::storage::CsrGraph;
use crate::types::{NodeId, RelId, INVALID_NODE};

/// Dense per-batch node arena for one layer: local slot `i` holds `nodes[i]`.
///
/// Slots follow first-insertion order, so a batch built from the same seeds
/// and RNG stream always lays out identically.
#[derive(Clone, Debug, Default)]
pub struct LayerIndex {
    nodes: Vec<NodeId>,
    slots: FxHashMap<NodeId, u32>,
}

impl LayerIndex {
    /// Deduplicates `ids` keeping the first occurrence of each.
    pub fn from_ids<I: IntoIterator<Item = NodeId>>(ids: I) -> Self {
        let ids = ids.into_iter();
        let (lower, _) = ids.size_hint();
        let mut index = Self {
            nodes: Vec::with_capacity(lower),
            slots: FxHashMap::default(),
        };
        index.slots.reserve(lower);
        for v in ids {
            index.insert(v);
        }
        index
    }

    fn insert(&mut self, v: NodeId) {
        let next = self.nodes.len() as u32;
        self.slots.entry(v).or_insert_with(|| {
            self.nodes.push(v);
            next
        });
    }

    /// Local slot of `v`, if `v` belongs to this layer.
    #[inline]
    pub fn slot(&self, v: NodeId) -> Option<usize> {
        self.slots.get(&v).map(|&s| s as usize)
    }

    /// True if `v` belongs to this layer.
    pub fn contains(&self, v: NodeId) -> bool {
        self.slots.contains_key(&v)
    }

    /// Node ids by slot.
    #[inline]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for an empty layer.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Sampled in-batch predecessors for every node of the layer above.
///
/// Target `i` owns `neighbors[offsets[i]..offsets[i+1]]` and the matching
/// `rels` range.
#[derive(Clone, Debug, Default)]
pub struct LayerSamples {
    /// `targets + 1` range starts.
    pub offsets: Vec<u32>,
    /// Sampled neighbor ids.
    pub neighbors: Vec<NodeId>,
    /// Relation id per sampled edge.
    pub rels: Vec<RelId>,
}

impl LayerSamples {
    /// Number of targets described.
    pub fn targets(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Sampled `(neighbors, rels)` of target `i`.
    #[inline]
    pub fn edges_of(&self, i: usize) -> (&[NodeId], &[RelId]) {
        let begin = self.offsets[i] as usize;
        let end = self.offsets[i + 1] as usize;
        (&self.neighbors[begin..end], &self.rels[begin..end])
    }
}

/// `L`-hop computation graph for one batch.
///
/// `layers[L]` holds the seeds, `layers[0]` the farthest sampled ancestors,
/// and `samples[l]` links every node of `layers[l + 1]` to its sampled
/// neighbors, all of which live in `layers[l]`.
#[derive(Clone, Debug, Default)]
pub struct BatchSubgraph {
    /// `L + 1` node layers.
    pub layers: Vec<LayerIndex>,
    /// `L` sample records.
    pub samples: Vec<LayerSamples>,
}

impl BatchSubgraph {
    /// Number of hops `L`.
    pub fn depth(&self) -> usize {
        self.samples.len()
    }

    /// The seed layer.
    pub fn top(&self) -> &LayerIndex {
        &self.layers[self.layers.len() - 1]
    }
}

/// Builds the computation graph backward from `seeds`, one hop per entry of
/// `fanouts` (innermost hop last).
///
/// Layer `l` is the union of layer `l + 1` and everything sampled for it, so
/// every sampled neighbor has a slot one layer down. Sentinel seeds are
/// dropped.
pub fn build_subgraph(
    graph: &CsrGraph,
    seeds: &[NodeId],
    fanouts: &[usize],
    rng: &mut XorShift128Plus,
) -> BatchSubgraph {
    let depth = fanouts.len();
    let mut layers = vec![LayerIndex::default(); depth + 1];
    let mut samples = vec![LayerSamples::default(); depth];
    layers[depth] =
        LayerIndex::from_ids(seeds.iter().copied().filter(|&v| v != INVALID_NODE));

    for l in (0..depth).rev() {
        let targets = layers[l + 1].nodes();
        let mut ls = LayerSamples {
            offsets: Vec::with_capacity(targets.len() + 1),
            neighbors: Vec::with_capacity(targets.len() * fanouts[l]),
            rels: Vec::with_capacity(targets.len() * fanouts[l]),
        };
        ls.offsets.push(0);
        for &v in targets {
            sample_neighbors(graph, v, fanouts[l], &mut ls.neighbors, &mut ls.rels, rng);
            ls.offsets.push(ls.neighbors.len() as u32);
        }
        let below = LayerIndex::from_ids(targets.iter().chain(&ls.neighbors).copied());
        trace!(
            layer = l,
            targets = targets.len(),
            sampled = ls.neighbors.len(),
            nodes = below.len(),
            "layer sampled"
        );
        layers[l] = below;
        samples[l] = ls;
    }

    BatchSubgraph { layers, samples }
}
