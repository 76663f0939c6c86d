//! Read-only, memory-mapped CSR store for a relation-typed directed multigraph.

use std::path::Path;

use tracing::{debug, info};

use crate::primitives::MappedArray;
use crate::types::{KgError, NodeId, RelId, Result};

/// File names making up one CSR array set inside a graph directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GraphFiles {
    /// `uint32[N+2]` edge range starts.
    pub offsets: &'static str,
    /// `uint32[M]` destination per edge.
    pub csr: &'static str,
    /// `uint16[M]` relation per edge.
    pub rels: &'static str,
    /// `uint32[N]` external entity ids; required for the forward set.
    pub entities: Option<&'static str>,
    /// `uint16[R]` external property ids; required for the forward set.
    pub props: Option<&'static str>,
}

impl GraphFiles {
    /// The five-array forward layout written by the converter.
    pub const fn forward() -> Self {
        Self {
            offsets: "offsets.bin",
            csr: "csr.bin",
            rels: "rels.bin",
            entities: Some("entities.bin"),
            props: Some("props.bin"),
        }
    }

    /// The three-array reverse layout written by [`super::build_reverse`].
    pub const fn reverse() -> Self {
        Self {
            offsets: "offsets_rev.bin",
            csr: "csr_rev.bin",
            rels: "rels_rev.bin",
            entities: None,
            props: None,
        }
    }
}

/// Zero-copy view of one node's outgoing edges.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdjView<'a> {
    /// Destination node per edge.
    pub dst: &'a [NodeId],
    /// Relation id per edge, index-aligned with `dst`.
    pub rel: &'a [RelId],
}

impl<'a> AdjView<'a> {
    /// Number of edges in the view.
    #[inline]
    pub fn size(&self) -> usize {
        self.dst.len()
    }

    /// True for nodes without outgoing edges and for out-of-range ids.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dst.is_empty()
    }

    /// Edge `i` as `(dst, rel)`.
    #[inline]
    pub fn edge(&self, i: usize) -> (NodeId, RelId) {
        (self.dst[i], self.rel[i])
    }

    /// Iterates `(dst, rel)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, RelId)> + 'a {
        self.dst.iter().copied().zip(self.rel.iter().copied())
    }
}

/// Immutable CSR graph over dense node ids `1..=N`.
///
/// All arrays stay mapped for the lifetime of the value and every accessor
/// borrows from them, so the type is safe to share between readers.
#[derive(Debug)]
pub struct CsrGraph {
    offsets: MappedArray<u32>,
    csr: MappedArray<u32>,
    rels: MappedArray<u16>,
    entities: Option<MappedArray<u32>>,
    props: Option<MappedArray<u16>>,
    num_nodes: u32,
    num_edges: u32,
}

impl CsrGraph {
    /// Maps the forward array set from `dir`.
    ///
    /// # Errors
    ///
    /// Fails if any of the five files is missing or unreadable, or if the
    /// arrays disagree on `N`/`M`. Mappings opened before the failure are
    /// released before returning.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load_custom(dir, GraphFiles::forward())
    }

    /// Maps the reverse array set (`*_rev.bin`) from `dir`.
    pub fn load_reverse(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load_custom(dir, GraphFiles::reverse())
    }

    /// Maps an arbitrary array set from `dir`.
    pub fn load_custom(dir: impl AsRef<Path>, files: GraphFiles) -> Result<Self> {
        let dir = dir.as_ref();
        let offsets_path = dir.join(files.offsets);
        let offsets = MappedArray::<u32>::open(&offsets_path)?;
        if offsets.len() < 2 {
            return Err(KgError::format(
                &offsets_path,
                format!("need at least 2 offsets, found {}", offsets.len()),
            ));
        }
        let n = offsets.len() - 2;
        let num_nodes = u32::try_from(n)
            .map_err(|_| KgError::format(&offsets_path, "node count exceeds u32"))?;
        let m = offsets.as_slice()[n + 1];
        check_offsets(offsets.as_slice(), &offsets_path)?;

        let csr = MappedArray::<u32>::open(dir.join(files.csr))?;
        let rels = MappedArray::<u16>::open(dir.join(files.rels))?;
        if csr.len() != m as usize || rels.len() != m as usize {
            return Err(KgError::format(
                csr.path(),
                format!(
                    "edge arrays disagree with offsets: csr={} rels={} offsets[N+1]={m}",
                    csr.len(),
                    rels.len()
                ),
            ));
        }

        let entities = match files.entities {
            Some(name) => {
                let entities = MappedArray::<u32>::open(dir.join(name))?;
                if entities.len() != n {
                    return Err(KgError::format(
                        entities.path(),
                        format!("entity map has {} entries for {n} nodes", entities.len()),
                    ));
                }
                Some(entities)
            }
            None => None,
        };
        let props = match files.props {
            Some(name) => Some(MappedArray::<u16>::open(dir.join(name))?),
            None => None,
        };

        let graph = Self {
            offsets,
            csr,
            rels,
            entities,
            props,
            num_nodes,
            num_edges: m,
        };
        info!(
            dir = %dir.display(),
            nodes = graph.num_nodes,
            edges = graph.num_edges,
            relations = graph.num_relations(),
            "graph mapped"
        );
        Ok(graph)
    }

    /// `N`, the largest valid node id.
    #[inline]
    pub fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    /// `M`, the total edge count.
    #[inline]
    pub fn num_edges(&self) -> u32 {
        self.num_edges
    }

    /// `R`, the number of relation ids (0 for array sets without `props`).
    #[inline]
    pub fn num_relations(&self) -> u32 {
        self.props.as_ref().map_or(0, |p| p.len() as u32)
    }

    /// Outgoing edges of `v`; empty for `v == 0` or `v > N`.
    #[inline]
    pub fn neighbors(&self, v: NodeId) -> AdjView<'_> {
        if v == 0 || v > self.num_nodes {
            return AdjView::default();
        }
        let offsets = self.offsets.as_slice();
        let begin = offsets[v as usize] as usize;
        let end = offsets[v as usize + 1] as usize;
        AdjView {
            dst: &self.csr.as_slice()[begin..end],
            rel: &self.rels.as_slice()[begin..end],
        }
    }

    /// Out-degree of `v` from the offsets difference; 0 when out of range.
    #[inline]
    pub fn out_degree(&self, v: NodeId) -> u32 {
        if v == 0 || v > self.num_nodes {
            return 0;
        }
        let offsets = self.offsets.as_slice();
        offsets[v as usize + 1] - offsets[v as usize]
    }

    /// External entity id of `v`; 0 when out of range or not mapped.
    pub fn entity_of(&self, v: NodeId) -> u32 {
        match &self.entities {
            Some(entities) if v != 0 && v <= self.num_nodes => entities.as_slice()[v as usize - 1],
            _ => 0,
        }
    }

    /// External property id of relation `r`; 0 when out of range or not mapped.
    pub fn prop_of(&self, r: u32) -> u16 {
        match &self.props {
            Some(props) if r != 0 && r as usize <= props.len() => props.as_slice()[r as usize - 1],
            _ => 0,
        }
    }

    /// Raw offsets array (`N + 2` entries).
    pub fn offsets(&self) -> &[u32] {
        self.offsets.as_slice()
    }
}

fn check_offsets(offsets: &[u32], path: &Path) -> Result<()> {
    let total = offsets[offsets.len() - 1];
    for (v, pair) in offsets.windows(2).enumerate().skip(1) {
        if pair[0] > pair[1] || pair[1] > total {
            return Err(KgError::format(
                path,
                format!("offsets decrease or overrun at node {v}"),
            ));
        }
    }
    debug!(nodes = offsets.len() - 2, edges = total, "offsets validated");
    Ok(())
}
