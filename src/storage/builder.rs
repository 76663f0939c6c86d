//! In-memory CSR assembly: the fill half of the corpus converter and the
//! reverse-graph builder.

use std::path::Path;

use tracing::info;

use super::graph::{CsrGraph, GraphFiles};
use crate::primitives::io::write_array;
use crate::types::{KgError, NodeId, RelId, Result};

/// The three edge arrays of one CSR direction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsrArrays {
    /// `N + 2` entries; `offsets[0]` and `offsets[1]` are both 0.
    pub offsets: Vec<u32>,
    /// Destination per edge.
    pub csr: Vec<u32>,
    /// Relation per edge.
    pub rels: Vec<u16>,
}

impl CsrArrays {
    /// Counting sort of `(src, rel, dst)` edges by source id. Edges keep their
    /// input order within a source.
    fn from_edges(num_nodes: u32, edges: &[(NodeId, RelId, NodeId)]) -> Self {
        let n = num_nodes as usize;
        let mut offsets = vec![0u32; n + 2];
        for &(src, _, _) in edges {
            offsets[src as usize + 1] += 1;
        }
        for v in 1..=n {
            offsets[v + 1] += offsets[v];
        }
        let mut cursor = offsets.clone();
        let mut csr = vec![0u32; edges.len()];
        let mut rels = vec![0u16; edges.len()];
        for &(src, rel, dst) in edges {
            let slot = cursor[src as usize] as usize;
            csr[slot] = dst;
            rels[slot] = rel;
            cursor[src as usize] += 1;
        }
        Self { offsets, csr, rels }
    }

    /// Writes the three arrays under the names in `files`.
    pub fn write_files(&self, dir: &Path, files: GraphFiles) -> Result<()> {
        write_array(dir.join(files.offsets), &self.offsets)?;
        write_array(dir.join(files.csr), &self.csr)?;
        write_array(dir.join(files.rels), &self.rels)?;
        Ok(())
    }
}

/// Accumulates typed edges over a fixed node and relation count and writes
/// the five-array forward layout.
#[derive(Clone, Debug)]
pub struct CsrBuilder {
    num_nodes: u32,
    num_relations: u32,
    edges: Vec<(NodeId, RelId, NodeId)>,
    entities: Option<Vec<u32>>,
    props: Option<Vec<u16>>,
}

impl CsrBuilder {
    /// Empty builder for nodes `1..=num_nodes` and relations `1..=num_relations`.
    pub fn new(num_nodes: u32, num_relations: u32) -> Self {
        Self {
            num_nodes,
            num_relations,
            edges: Vec::new(),
            entities: None,
            props: None,
        }
    }

    /// Queues the edge `src -[rel]-> dst`.
    pub fn add_edge(&mut self, src: NodeId, rel: RelId, dst: NodeId) -> &mut Self {
        self.edges.push((src, rel, dst));
        self
    }

    /// External entity ids, indexed by `node_id - 1`. Defaults to `1..=N`.
    pub fn entities(&mut self, entities: Vec<u32>) -> &mut Self {
        self.entities = Some(entities);
        self
    }

    /// External property ids, indexed by `relation_id - 1`. Defaults to `1..=R`.
    pub fn props(&mut self, props: Vec<u16>) -> &mut Self {
        self.props = Some(props);
        self
    }

    /// Number of queued edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Validates the queued edges and lays them out as CSR.
    pub fn build(&self) -> Result<CsrArrays> {
        if self.num_relations > u32::from(u16::MAX) {
            return Err(KgError::InvalidConfig(format!(
                "{} relations do not fit 16-bit relation ids",
                self.num_relations
            )));
        }
        for &(src, rel, dst) in &self.edges {
            let in_range = |v: NodeId| v != 0 && v <= self.num_nodes;
            if !in_range(src) || !in_range(dst) {
                return Err(KgError::InvalidConfig(format!(
                    "edge {src}->{dst} outside node range 1..={}",
                    self.num_nodes
                )));
            }
            if rel == 0 || u32::from(rel) > self.num_relations {
                return Err(KgError::InvalidConfig(format!(
                    "relation {rel} outside 1..={}",
                    self.num_relations
                )));
            }
        }
        if u32::try_from(self.edges.len()).is_err() {
            return Err(KgError::InvalidConfig("edge count exceeds u32".into()));
        }
        Ok(CsrArrays::from_edges(self.num_nodes, &self.edges))
    }

    /// Builds and writes `offsets.bin`, `csr.bin`, `rels.bin`,
    /// `entities.bin` and `props.bin` into `dir`.
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<CsrArrays> {
        let dir = dir.as_ref();
        let arrays = self.build()?;
        let files = GraphFiles::forward();
        arrays.write_files(dir, files)?;

        let entities = match &self.entities {
            Some(e) if e.len() == self.num_nodes as usize => e.clone(),
            Some(e) => {
                return Err(KgError::InvalidConfig(format!(
                    "{} entity ids for {} nodes",
                    e.len(),
                    self.num_nodes
                )))
            }
            None => (1..=self.num_nodes).collect(),
        };
        let props = match &self.props {
            Some(p) if p.len() == self.num_relations as usize => p.clone(),
            Some(p) => {
                return Err(KgError::InvalidConfig(format!(
                    "{} property ids for {} relations",
                    p.len(),
                    self.num_relations
                )))
            }
            None => (1..=self.num_relations as u16).collect(),
        };
        if let Some(name) = files.entities {
            write_array(dir.join(name), &entities)?;
        }
        if let Some(name) = files.props {
            write_array(dir.join(name), &props)?;
        }
        info!(
            dir = %dir.display(),
            nodes = self.num_nodes,
            edges = arrays.csr.len(),
            relations = self.num_relations,
            "graph written"
        );
        Ok(arrays)
    }
}

/// Edge-flipped copy of a forward graph; relations are kept per edge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReverseArrays {
    /// Arrays in reverse orientation: `offsets[v]..offsets[v+1]` lists the
    /// sources of `v`'s incoming edges.
    pub arrays: CsrArrays,
}

impl ReverseArrays {
    /// Writes `offsets_rev.bin`, `csr_rev.bin` and `rels_rev.bin` into `dir`.
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<()> {
        self.arrays.write_files(dir.as_ref(), GraphFiles::reverse())
    }

    /// In-degree of `v` from the reverse offsets; 0 when out of range.
    pub fn in_degree(&self, v: NodeId) -> u32 {
        let offsets = &self.arrays.offsets;
        if v == 0 || v as usize + 1 >= offsets.len() {
            return 0;
        }
        offsets[v as usize + 1] - offsets[v as usize]
    }
}

/// In-degree count, prefix sum, cursor fill. Incoming edges of a node are
/// ordered by ascending source id.
pub fn build_reverse(graph: &CsrGraph) -> ReverseArrays {
    let n = graph.num_nodes();
    let mut flipped = Vec::with_capacity(graph.num_edges() as usize);
    for u in 1..=n {
        for (dst, rel) in graph.neighbors(u).iter() {
            if dst != 0 && dst <= n {
                flipped.push((dst, rel, u));
            }
        }
    }
    ReverseArrays {
        arrays: CsrArrays::from_edges(n, &flipped),
    }
}
