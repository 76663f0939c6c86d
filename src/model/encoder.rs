use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::features::{compute_base_features, FeatureConfig};
use super::params::Parameter;
use crate::primitives::XorShift128Plus;
use crate::sampling::{build_subgraph, BatchSubgraph, LayerIndex};
use crate::storage::CsrGraph;
use crate::types::{KgError, NodeId, RelId, Result};

/// Shape of the aggregation stack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Width of every hidden layer and of the relation embeddings.
    pub hidden_dim: usize,
    /// Number of aggregation layers `L`.
    pub layers: usize,
    /// Per-hop sample sizes, outermost hop first; must have `L` entries.
    pub fanouts: Vec<usize>,
    /// Apply ReLU after every projection.
    pub use_relu: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 64,
            layers: 2,
            fanouts: vec![20, 10],
            use_relu: true,
        }
    }
}

impl EncoderConfig {
    /// Rejects shapes the forward pass cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_dim == 0 {
            return Err(KgError::InvalidConfig("hidden_dim must be positive".into()));
        }
        if self.layers == 0 {
            return Err(KgError::InvalidConfig("at least one layer is required".into()));
        }
        if self.fanouts.len() != self.layers {
            return Err(KgError::InvalidConfig(format!(
                "{} layers but {} fanouts",
                self.layers,
                self.fanouts.len()
            )));
        }
        Ok(())
    }
}

/// Everything one forward pass caches for the matching backward pass.
///
/// Buffers are row-major with one `hidden_dim` row per local slot of the
/// corresponding subgraph layer.
#[derive(Clone, Debug, Default)]
pub struct EncoderState {
    /// The batch computation graph, including per-layer index maps.
    pub subgraph: BatchSubgraph,
    /// Pre-activations, `L + 1` layers.
    pub pre: Vec<Vec<f32>>,
    /// Post-activations, `L + 1` layers.
    pub hidden: Vec<Vec<f32>>,
    /// Mean neighbor aggregates feeding layers `1..=L`.
    pub agg: Vec<Vec<f32>>,
    /// Raw feature matrix of layer 0.
    pub features: Vec<f32>,
    hidden_dim: usize,
}

impl EncoderState {
    /// Node-to-slot maps, layer 0 first.
    pub fn index_per_layer(&self) -> &[LayerIndex] {
        &self.subgraph.layers
    }

    /// Slot map of the seed layer.
    pub fn top_index(&self) -> &LayerIndex {
        self.subgraph.top()
    }

    /// Final-layer embeddings of every seed, by slot.
    pub fn output(&self) -> &[f32] {
        self.hidden.last().map_or(&[], Vec::as_slice)
    }

    /// Final-layer embedding of seed `v`.
    pub fn embedding(&self, v: NodeId) -> Option<&[f32]> {
        let slot = self.top_index().slot(v)?;
        let h = self.hidden_dim;
        Some(&self.output()[slot * h..(slot + 1) * h])
    }

    /// Zero gradient buffer shaped like [`EncoderState::output`].
    pub fn output_grad(&self) -> Vec<f32> {
        vec![0.0; self.output().len()]
    }

    /// Row width.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}

/// Input projection, aggregation layers and the shared relation table.
#[derive(Clone, Debug)]
pub struct Encoder {
    config: EncoderConfig,
    features: FeatureConfig,
    feature_dim: usize,
    num_relations: usize,
    input_w: Parameter,
    input_b: Parameter,
    layer_w: Vec<Parameter>,
    layer_b: Vec<Parameter>,
    rel_emb: Parameter,
}

impl Encoder {
    /// Validates `config` and draws all weights from `rng` in parameter
    /// order, interleaving each layer's weight and bias.
    pub fn new(
        feature_dim: usize,
        num_relations: usize,
        config: EncoderConfig,
        mut features: FeatureConfig,
        rng: &mut XorShift128Plus,
    ) -> Result<Self> {
        config.validate()?;
        if feature_dim == 0 {
            return Err(KgError::InvalidConfig("feature_dim must be positive".into()));
        }
        if feature_dim <= 1 && features.use_in_degree {
            warn!(feature_dim, "in-degree feature has no column; disabling it");
            features.use_in_degree = false;
        }
        let h = config.hidden_dim;
        let input_w = Parameter::uniform("input_w", feature_dim * h, 0.1, rng);
        let input_b = Parameter::uniform("input_b", h, 0.01, rng);
        let layer_scale = 0.1 / (h as f32).sqrt();
        let mut layer_w = Vec::with_capacity(config.layers);
        let mut layer_b = Vec::with_capacity(config.layers);
        for l in 0..config.layers {
            layer_w.push(Parameter::uniform(
                format!("layer_w.{l}"),
                2 * h * h,
                layer_scale,
                rng,
            ));
            layer_b.push(Parameter::uniform(format!("layer_b.{l}"), h, 0.01, rng));
        }
        let rel_emb = Parameter::uniform("rel_emb", (num_relations + 1) * h, 0.1, rng);
        debug!(feature_dim, num_relations, hidden = h, layers = config.layers, "encoder initialized");
        Ok(Self {
            config,
            features,
            feature_dim,
            num_relations,
            input_w,
            input_b,
            layer_w,
            layer_b,
            rel_emb,
        })
    }

    /// Samples the batch subgraph for `seeds` and runs the forward pass.
    pub fn forward(
        &self,
        graph: &CsrGraph,
        reverse: Option<&CsrGraph>,
        seeds: &[NodeId],
        rng: &mut XorShift128Plus,
    ) -> EncoderState {
        let subgraph = build_subgraph(graph, seeds, &self.config.fanouts, rng);
        self.forward_subgraph(graph, reverse, subgraph)
    }

    /// Forward pass over an already sampled subgraph.
    pub fn forward_subgraph(
        &self,
        graph: &CsrGraph,
        reverse: Option<&CsrGraph>,
        subgraph: BatchSubgraph,
    ) -> EncoderState {
        let h = self.config.hidden_dim;
        let fd = self.feature_dim;
        let depth = subgraph.depth();
        let features = compute_base_features(
            graph,
            reverse,
            subgraph.layers[0].nodes(),
            &self.features,
            fd,
        );

        let mut pre0 = vec![0.0f32; subgraph.layers[0].len() * h];
        for (row, feat) in pre0.chunks_exact_mut(h).zip(features.chunks_exact(fd)) {
            row.copy_from_slice(&self.input_b.data);
            for (f, &x) in feat.iter().enumerate() {
                let w = &self.input_w.data[f * h..(f + 1) * h];
                for (out, &wv) in row.iter_mut().zip(w) {
                    *out += x * wv;
                }
            }
        }

        let mut hidden = Vec::with_capacity(depth + 1);
        let mut pre = Vec::with_capacity(depth + 1);
        let mut agg = Vec::with_capacity(depth);
        hidden.push(self.activate(&pre0));
        pre.push(pre0);
        for l in 0..depth {
            let (pre_l, agg_l) = self.aggregate_layer(l, &subgraph, &hidden[l]);
            hidden.push(self.activate(&pre_l));
            pre.push(pre_l);
            agg.push(agg_l);
        }

        EncoderState {
            subgraph,
            pre,
            hidden,
            agg,
            features,
            hidden_dim: h,
        }
    }

    /// Pre-activations and mean aggregates of layer `l + 1`.
    fn aggregate_layer(
        &self,
        l: usize,
        subgraph: &BatchSubgraph,
        h_below: &[f32],
    ) -> (Vec<f32>, Vec<f32>) {
        let h = self.config.hidden_dim;
        let targets = subgraph.layers[l + 1].nodes();
        let below = &subgraph.layers[l];
        let samples = &subgraph.samples[l];
        let w = &self.layer_w[l].data;
        let b = &self.layer_b[l].data;

        let mut agg = vec![0.0f32; targets.len() * h];
        let mut pre = vec![0.0f32; targets.len() * h];
        for (ti, &v) in targets.iter().enumerate() {
            let agg_row = &mut agg[ti * h..(ti + 1) * h];
            let (nbrs, rels) = samples.edges_of(ti);
            if !nbrs.is_empty() {
                for (&nb, &rel) in nbrs.iter().zip(rels) {
                    let Some(slot) = below.slot(nb) else { continue };
                    let nb_row = &h_below[slot * h..(slot + 1) * h];
                    match self.relation_row(rel) {
                        Some(rv) => {
                            for d in 0..h {
                                agg_row[d] += nb_row[d] + rv[d];
                            }
                        }
                        None => {
                            for d in 0..h {
                                agg_row[d] += nb_row[d];
                            }
                        }
                    }
                }
                let inv = 1.0 / nbrs.len() as f32;
                for x in agg_row.iter_mut() {
                    *x *= inv;
                }
            }

            let self_row = below.slot(v).map(|s| &h_below[s * h..(s + 1) * h]);
            let pre_row = &mut pre[ti * h..(ti + 1) * h];
            for d in 0..h {
                let mut sum = b[d];
                for k in 0..h {
                    let self_val = self_row.map_or(0.0, |r| r[k]);
                    sum += self_val * w[k * h + d];
                    sum += agg_row[k] * w[(h + k) * h + d];
                }
                pre_row[d] = sum;
            }
        }
        (pre, agg)
    }

    fn activate(&self, pre: &[f32]) -> Vec<f32> {
        if self.config.use_relu {
            pre.iter().map(|&x| x.max(0.0)).collect()
        } else {
            pre.to_vec()
        }
    }

    fn relation_row(&self, rel: RelId) -> Option<&[f32]> {
        let r = usize::from(rel);
        if r > self.num_relations {
            return None;
        }
        let h = self.config.hidden_dim;
        Some(&self.rel_emb.data[r * h..(r + 1) * h])
    }

    /// Reverse pass from the final-layer gradient `grad_top`, accumulating
    /// into every encoder gradient buffer including the relation table.
    ///
    /// All writes are additions; call `zero_grad` on the parameters before
    /// the batch.
    ///
    /// # Panics
    ///
    /// If `grad_top` is not `top().len() * hidden_dim` long.
    pub fn backward(&mut self, state: &EncoderState, grad_top: Vec<f32>) {
        let h = self.config.hidden_dim;
        let relu = self.config.use_relu;
        let sg = &state.subgraph;
        let depth = sg.depth();

        let expected = sg.top().len() * h;
        assert_eq!(
            grad_top.len(),
            expected,
            "top gradient length does not match the final layer"
        );
        let mut grad_out = grad_top;

        let mut grad_concat = vec![0.0f32; 2 * h];
        for l in (0..depth).rev() {
            let below = &sg.layers[l];
            let targets = sg.layers[l + 1].nodes();
            let samples = &sg.samples[l];
            let pre = &state.pre[l + 1];
            let h_below = &state.hidden[l];
            let agg = &state.agg[l];
            let mut grad_below = vec![0.0f32; below.len() * h];

            for (ti, &v) in targets.iter().enumerate() {
                let g = &mut grad_out[ti * h..(ti + 1) * h];
                if relu {
                    for (gd, &p) in g.iter_mut().zip(&pre[ti * h..(ti + 1) * h]) {
                        if p <= 0.0 {
                            *gd = 0.0;
                        }
                    }
                }
                let self_slot = below.slot(v);
                let agg_row = &agg[ti * h..(ti + 1) * h];

                let wg = &mut self.layer_w[l].grad;
                let bg = &mut self.layer_b[l].grad;
                for d_out in 0..h {
                    let gd = g[d_out];
                    bg[d_out] += gd;
                    for k in 0..h {
                        if let Some(s) = self_slot {
                            wg[k * h + d_out] += gd * h_below[s * h + k];
                        }
                        wg[(h + k) * h + d_out] += gd * agg_row[k];
                    }
                }

                let w = &self.layer_w[l].data;
                for (k, gc) in grad_concat.iter_mut().enumerate() {
                    let w_row = &w[k * h..(k + 1) * h];
                    *gc = g.iter().zip(w_row).map(|(a, b)| a * b).sum();
                }

                if let Some(s) = self_slot {
                    for (gb, &gc) in grad_below[s * h..(s + 1) * h].iter_mut().zip(&grad_concat[..h]) {
                        *gb += gc;
                    }
                }

                let (nbrs, rels) = samples.edges_of(ti);
                if nbrs.is_empty() {
                    continue;
                }
                let inv = 1.0 / nbrs.len() as f32;
                for (&nb, &rel) in nbrs.iter().zip(rels) {
                    let Some(slot) = below.slot(nb) else { continue };
                    let rel_ok = usize::from(rel) <= self.num_relations;
                    let r = usize::from(rel);
                    for d in 0..h {
                        let share = grad_concat[h + d] * inv;
                        grad_below[slot * h + d] += share;
                        if rel_ok {
                            self.rel_emb.grad[r * h + d] += share;
                        }
                    }
                }
            }
            grad_out = grad_below;
        }

        let fd = self.feature_dim;
        for (i, g) in grad_out.chunks_exact_mut(h).enumerate() {
            if relu {
                for (gd, &p) in g.iter_mut().zip(&state.pre[0][i * h..(i + 1) * h]) {
                    if p <= 0.0 {
                        *gd = 0.0;
                    }
                }
            }
            let feat = &state.features[i * fd..(i + 1) * fd];
            for d in 0..h {
                let gd = g[d];
                self.input_b.grad[d] += gd;
                for (f, &x) in feat.iter().enumerate() {
                    self.input_w.grad[f * h + d] += gd * x;
                }
            }
        }
    }

    /// Parameters in checkpoint order: `input_w`, `input_b`, every
    /// `layer_w`, every `layer_b`, `rel_emb`.
    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut ps = vec![&self.input_w, &self.input_b];
        ps.extend(self.layer_w.iter());
        ps.extend(self.layer_b.iter());
        ps.push(&self.rel_emb);
        ps
    }

    /// Mutable parameters in checkpoint order.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut ps = vec![&mut self.input_w, &mut self.input_b];
        ps.extend(self.layer_w.iter_mut());
        ps.extend(self.layer_b.iter_mut());
        ps.push(&mut self.rel_emb);
        ps
    }

    /// Shared relation-embedding table, `(R + 1) x hidden_dim`.
    pub fn relation_embeddings(&self) -> &Parameter {
        &self.rel_emb
    }

    /// Mutable relation table, lent to the decoder for one loss computation.
    pub fn relation_embeddings_mut(&mut self) -> &mut Parameter {
        &mut self.rel_emb
    }

    /// Validated configuration.
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Feature configuration after normalization.
    pub fn feature_config(&self) -> &FeatureConfig {
        &self.features
    }

    /// Raw feature width.
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// `R`.
    pub fn num_relations(&self) -> usize {
        self.num_relations
    }

    /// Output width.
    pub fn output_dim(&self) -> usize {
        self.config.hidden_dim
    }
}
