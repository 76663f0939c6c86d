//! Whole-graph embedding cache, filtered link-prediction ranking, and top-k
//! queries over relations and tails.
//!
//! Everything here is read-only with respect to the model, so the cache build
//! and the ranking loop run on rayon's pool.

/// MRR and Hits@k accumulation.
pub mod metrics;

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, info};

use crate::model::{Decoder, Encoder};
use crate::primitives::XorShift128Plus;
use crate::storage::{CsrGraph, Triple};
use crate::types::{KgError, NodeId, Result};

pub use metrics::RankMetrics;

/// Final-layer embedding of every node, row `v - 1` for node `v`.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingCache {
    dim: usize,
    data: Vec<f32>,
}

impl EmbeddingCache {
    /// Embeds nodes `1..=N` in chunks of `chunk` seeds.
    ///
    /// Chunk `k` samples with stream `k` of `seed`, so the result does not
    /// depend on how rayon schedules the chunks.
    pub fn build(
        encoder: &Encoder,
        graph: &CsrGraph,
        reverse: Option<&CsrGraph>,
        chunk: usize,
        seed: u64,
    ) -> Result<Self> {
        if chunk == 0 {
            return Err(KgError::InvalidConfig("chunk size must be positive".into()));
        }
        let dim = encoder.output_dim();
        let n = graph.num_nodes() as usize;
        let mut data = vec![0.0f32; n * dim];
        data.par_chunks_mut(chunk * dim)
            .enumerate()
            .for_each(|(k, out)| {
                let start = (k * chunk) as NodeId + 1;
                let seeds: Vec<NodeId> = (start..start + (out.len() / dim) as NodeId).collect();
                let mut rng = XorShift128Plus::new(seed, k as u64);
                let state = encoder.forward(graph, reverse, &seeds, &mut rng);
                for (row, &v) in out.chunks_exact_mut(dim).zip(&seeds) {
                    if let Some(emb) = state.embedding(v) {
                        row.copy_from_slice(emb);
                    }
                }
                debug!(chunk = k, first = start, nodes = seeds.len(), "chunk embedded");
            });
        info!(nodes = n, dim, chunk, "embedding cache built");
        Ok(Self { dim, data })
    }

    /// Wraps precomputed rows.
    pub fn from_rows(dim: usize, data: Vec<f32>) -> Result<Self> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(KgError::InvalidConfig(format!(
                "{} values do not form rows of width {dim}",
                data.len()
            )));
        }
        Ok(Self { dim, data })
    }

    /// Embedding of node `v`; `None` for 0 and ids past the end.
    pub fn get(&self, v: NodeId) -> Option<&[f32]> {
        let i = (v as usize).checked_sub(1)?;
        self.data.get(i * self.dim..(i + 1) * self.dim)
    }

    /// Row width.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of rows.
    pub fn num_nodes(&self) -> usize {
        self.data.len() / self.dim
    }

    /// Row-major table.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Known true tails per `(head, relation)`, used to filter ranking.
#[derive(Clone, Debug, Default)]
pub struct TrueTails {
    tails: FxHashMap<u64, FxHashSet<NodeId>>,
}

impl TrueTails {
    /// Collects every triple of every set.
    pub fn from_sets<'a>(sets: impl IntoIterator<Item = &'a [Triple]>) -> Self {
        let mut filter = Self::default();
        for set in sets {
            for t in set {
                filter.insert(t);
            }
        }
        filter
    }

    /// Records `t.tail` as a true tail of `(t.head, t.relation)`.
    pub fn insert(&mut self, t: &Triple) {
        self.tails.entry(key(t.head, t.relation)).or_default().insert(t.tail);
    }

    /// Whether `tail` is known for `(head, relation)`.
    pub fn contains(&self, head: NodeId, relation: u32, tail: NodeId) -> bool {
        self.tails
            .get(&key(head, relation))
            .is_some_and(|set| set.contains(&tail))
    }

    /// Distinct `(head, relation)` pairs.
    pub fn len(&self) -> usize {
        self.tails.len()
    }

    /// True when nothing was inserted.
    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }
}

#[inline]
fn key(head: NodeId, relation: u32) -> u64 {
    (u64::from(head) << 32) | u64::from(relation)
}

/// Result of [`evaluate_link_prediction`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LinkPredictionReport {
    /// Finalized ranking metrics over the scored queries.
    pub metrics: RankMetrics,
    /// Queries dropped for a zero or out-of-range id.
    pub skipped: usize,
}

/// Candidate id with its score.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Scored {
    /// Node or relation id.
    pub id: u32,
    /// Model score.
    pub score: f32,
}

/// Best candidates for a query and, when the query names one, the rank of
/// the true answer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Ranking {
    /// Highest-scoring candidates, best first.
    pub top: Vec<Scored>,
    /// 1 + number of candidates scoring strictly higher than the answer.
    pub rank: Option<u64>,
}

fn relation_row(rel_emb: &[f32], dim: usize, r: u32) -> Option<&[f32]> {
    let r = r as usize;
    rel_emb.get(r * dim..(r + 1) * dim)
}

/// Filtered tail ranking of every query against all `N` candidates.
///
/// For each `(h, r, t)` the DistMult score of the true tail is compared with
/// every other node that is not a known tail of `(h, r)` in `filter`. Queries
/// with a zero id, an id past the cache, or an unknown relation are skipped
/// and counted.
pub fn evaluate_link_prediction(
    cache: &EmbeddingCache,
    rel_emb: &[f32],
    eval: &[Triple],
    filter: &TrueTails,
) -> LinkPredictionReport {
    let dim = cache.dim();
    let n = cache.num_nodes() as NodeId;
    let (mut metrics, skipped) = eval
        .par_iter()
        .fold(
            || (RankMetrics::default(), 0usize),
            |(mut acc, mut skipped), q| {
                let parts = (
                    cache.get(q.head).filter(|_| !q.has_sentinel()),
                    relation_row(rel_emb, dim, q.relation),
                    cache.get(q.tail),
                );
                let (Some(h), Some(r), Some(t)) = parts else {
                    skipped += 1;
                    return (acc, skipped);
                };
                let truth = Decoder::score(h, r, t);
                let mut higher = 0u64;
                for v in 1..=n {
                    if v == q.tail || filter.contains(q.head, q.relation, v) {
                        continue;
                    }
                    if let Some(cand) = cache.get(v) {
                        if Decoder::score(h, r, cand) > truth {
                            higher += 1;
                        }
                    }
                }
                acc.accumulate(1 + higher);
                (acc, skipped)
            },
        )
        .reduce(
            || (RankMetrics::default(), 0usize),
            |(mut a, sa), (b, sb)| {
                a.merge(&b);
                (a, sa + sb)
            },
        );
    metrics.finalize();
    info!(
        queries = eval.len(),
        scored = metrics.count,
        skipped,
        mrr = metrics.mrr,
        hits10 = metrics.hits10,
        "link prediction evaluated"
    );
    LinkPredictionReport { metrics, skipped }
}

fn top_k(mut scored: Vec<Scored>, k: usize) -> Vec<Scored> {
    let order = |a: &Scored, b: &Scored| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id));
    if k == 0 {
        return Vec::new();
    }
    if k < scored.len() {
        scored.select_nth_unstable_by(k - 1, order);
        scored.truncate(k);
    }
    scored.sort_unstable_by(order);
    scored
}

/// Scores relations `1..=R` for `(query.head, query.tail)` with the
/// relation classifier. `None` when either endpoint is zero or unknown.
pub fn rank_relations(
    decoder: &Decoder,
    cache: &EmbeddingCache,
    query: &Triple,
    topk: usize,
) -> Option<Ranking> {
    if query.head == 0 || query.tail == 0 {
        return None;
    }
    let h = cache.get(query.head)?;
    let t = cache.get(query.tail)?;
    let logits = decoder.relation_logits(h, t);
    let gold = query.relation as usize;
    let rank = (gold != 0 && gold < logits.len()).then(|| {
        1 + logits[1..].iter().filter(|&&s| s > logits[gold]).count() as u64
    });
    let scored = logits
        .iter()
        .enumerate()
        .skip(1)
        .map(|(r, &score)| Scored { id: r as u32, score })
        .collect();
    Some(Ranking {
        top: top_k(scored, topk),
        rank,
    })
}

/// Scores every node as the tail of `(query.head, query.relation)`.
/// `None` when the head or relation is zero or unknown.
pub fn rank_tails(
    cache: &EmbeddingCache,
    rel_emb: &[f32],
    query: &Triple,
    topk: usize,
) -> Option<Ranking> {
    if query.head == 0 || query.relation == 0 {
        return None;
    }
    let h = cache.get(query.head)?;
    let r = relation_row(rel_emb, cache.dim(), query.relation)?;
    let scored: Vec<Scored> = (1..=cache.num_nodes() as NodeId)
        .filter_map(|v| {
            cache.get(v).map(|t| Scored {
                id: v,
                score: Decoder::score(h, r, t),
            })
        })
        .collect();
    let rank = cache.get(query.tail).map(|t| {
        let truth = Decoder::score(h, r, t);
        1 + scored.iter().filter(|s| s.score > truth).count() as u64
    });
    Some(Ranking {
        top: top_k(scored, topk),
        rank,
    })
}
