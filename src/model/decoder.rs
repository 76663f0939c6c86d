use serde::Serialize;
use tracing::debug;

use super::params::Parameter;
use crate::primitives::XorShift128Plus;
use crate::sampling::LayerIndex;
use crate::storage::Triple;
use crate::types::NodeId;

/// Loss value plus how many entries contributed and how many were dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LossOutput {
    /// Batch-averaged loss.
    pub loss: f32,
    /// Positives that contributed to loss and gradient.
    pub scored: usize,
    /// Positives dropped because an id was absent from the batch or the
    /// relation id was out of range.
    pub skipped_positives: usize,
    /// Negatives dropped because the id was absent from the batch.
    pub skipped_negatives: usize,
}

impl LossOutput {
    /// Sums two outputs over the same batch.
    pub fn merge(self, other: LossOutput) -> LossOutput {
        LossOutput {
            loss: self.loss + other.loss,
            scored: self.scored + other.scored,
            skipped_positives: self.skipped_positives + other.skipped_positives,
            skipped_negatives: self.skipped_negatives + other.skipped_negatives,
        }
    }
}

/// Relation classifier over `φ = [h; t; h⊙t; |h-t|]` plus the DistMult
/// link scorer; the relation table itself belongs to the encoder.
#[derive(Clone, Debug)]
pub struct Decoder {
    num_relations: usize,
    dim: usize,
    rel_cls_w: Parameter,
    rel_cls_b: Parameter,
}

impl Decoder {
    /// Draws the classifier weights from `rng`.
    pub fn new(num_relations: usize, dim: usize, rng: &mut XorShift128Plus) -> Self {
        let scale = 0.1 / (dim as f32).sqrt();
        let rel_cls_w = Parameter::uniform("rel_cls_w", (num_relations + 1) * 4 * dim, scale, rng);
        let rel_cls_b = Parameter::uniform("rel_cls_b", num_relations + 1, 0.01, rng);
        Self {
            num_relations,
            dim,
            rel_cls_w,
            rel_cls_b,
        }
    }

    /// DistMult score `Σ h·r·t`.
    #[inline]
    pub fn score(h: &[f32], r: &[f32], t: &[f32]) -> f32 {
        h.iter().zip(r).zip(t).map(|((a, b), c)| a * b * c).sum()
    }

    /// Logistic link loss: label +1 for every positive, -1 for each of its
    /// `neg_per_pos` corrupted tails in `negatives`.
    ///
    /// Gradients go to the head, tail and negative rows of `grad_out` and to
    /// the relation rows of `rel_emb.grad`. They are gradients of the summed
    /// loss; the returned loss is the mean over `positives`.
    #[allow(clippy::too_many_arguments)]
    pub fn distmult_loss(
        &self,
        rel_emb: &mut Parameter,
        positives: &[Triple],
        negatives: &[NodeId],
        neg_per_pos: usize,
        index: &LayerIndex,
        embeddings: &[f32],
        grad_out: &mut [f32],
    ) -> LossOutput {
        let dim = self.dim;
        let mut out = LossOutput::default();
        let mut loss = 0.0f32;
        let row = |slot: usize| &embeddings[slot * dim..(slot + 1) * dim];

        for (i, triple) in positives.iter().enumerate() {
            let r = triple.relation as usize;
            let (Some(hs), Some(ts)) = (index.slot(triple.head), index.slot(triple.tail)) else {
                out.skipped_positives += 1;
                continue;
            };
            if r > self.num_relations {
                out.skipped_positives += 1;
                continue;
            }
            out.scored += 1;
            let rvec = &rel_emb.data[r * dim..(r + 1) * dim];
            let h = row(hs);
            let t = row(ts);

            let score = Self::score(h, rvec, t);
            let pos_grad = -1.0 / (1.0 + score.exp());
            loss += (-score).exp().ln_1p();
            for d in 0..dim {
                grad_out[hs * dim + d] += pos_grad * rvec[d] * t[d];
                grad_out[ts * dim + d] += pos_grad * rvec[d] * h[d];
                rel_emb.grad[r * dim + d] += pos_grad * h[d] * t[d];
            }

            let start = i * neg_per_pos;
            let negs = negatives.get(start..start + neg_per_pos).unwrap_or(&[]);
            for &neg in negs {
                let Some(ns) = index.slot(neg) else {
                    out.skipped_negatives += 1;
                    continue;
                };
                let n = row(ns);
                let s = Self::score(h, rvec, n);
                let neg_grad = 1.0 / (1.0 + (-s).exp());
                loss += s.exp().ln_1p();
                for d in 0..dim {
                    grad_out[hs * dim + d] += neg_grad * rvec[d] * n[d];
                    grad_out[ns * dim + d] += neg_grad * rvec[d] * h[d];
                    rel_emb.grad[r * dim + d] += neg_grad * h[d] * n[d];
                }
            }
        }
        if !positives.is_empty() {
            loss /= positives.len() as f32;
        }
        out.loss = loss;
        out
    }

    /// Classifier logits for relations `1..=R`; index 0 is unused and left 0.
    pub fn relation_logits(&self, h: &[f32], t: &[f32]) -> Vec<f32> {
        let phi = self.phi(h, t);
        let mut logits = vec![0.0f32; self.num_relations + 1];
        for (r, logit) in logits.iter_mut().enumerate().skip(1) {
            *logit = self.logit(r, &phi);
        }
        logits
    }

    fn phi(&self, h: &[f32], t: &[f32]) -> Vec<f32> {
        let dim = self.dim;
        let mut phi = vec![0.0f32; 4 * dim];
        for d in 0..dim {
            phi[d] = h[d];
            phi[dim + d] = t[d];
            phi[2 * dim + d] = h[d] * t[d];
            phi[3 * dim + d] = (h[d] - t[d]).abs();
        }
        phi
    }

    #[inline]
    fn logit(&self, r: usize, phi: &[f32]) -> f32 {
        let width = phi.len();
        let w = &self.rel_cls_w.data[r * width..(r + 1) * width];
        self.rel_cls_b.data[r] + w.iter().zip(phi).map(|(a, b)| a * b).sum::<f32>()
    }

    /// Softmax cross-entropy of the gold relation over `1..=R`, scaled by
    /// `weight`. Gradients of the summed loss go to the classifier and to
    /// `grad_out`; the returned loss is the mean.
    pub fn relation_loss(
        &mut self,
        positives: &[Triple],
        index: &LayerIndex,
        embeddings: &[f32],
        grad_out: &mut [f32],
        weight: f32,
    ) -> LossOutput {
        let dim = self.dim;
        let width = 4 * dim;
        let mut out = LossOutput::default();
        let mut loss = 0.0f32;
        let mut logits = vec![0.0f32; self.num_relations + 1];
        let mut grad_phi = vec![0.0f32; width];

        for triple in positives {
            let gold = triple.relation as usize;
            let (Some(hs), Some(ts)) = (index.slot(triple.head), index.slot(triple.tail)) else {
                out.skipped_positives += 1;
                continue;
            };
            if gold == 0 || gold > self.num_relations {
                out.skipped_positives += 1;
                continue;
            }
            out.scored += 1;
            let h = &embeddings[hs * dim..(hs + 1) * dim];
            let t = &embeddings[ts * dim..(ts + 1) * dim];
            let phi = self.phi(h, t);

            let mut max_logit = f32::NEG_INFINITY;
            for r in 1..=self.num_relations {
                logits[r] = self.logit(r, &phi);
                max_logit = max_logit.max(logits[r]);
            }
            let denom: f32 = logits[1..].iter().map(|l| (l - max_logit).exp()).sum();
            let log_denom = denom.ln() + max_logit;
            loss += (log_denom - logits[gold]) * weight;

            grad_phi.fill(0.0);
            for r in 1..=self.num_relations {
                let prob = (logits[r] - log_denom).exp();
                let g = (prob - if r == gold { 1.0 } else { 0.0 }) * weight;
                self.rel_cls_b.grad[r] += g;
                let base = r * width;
                for k in 0..width {
                    self.rel_cls_w.grad[base + k] += g * phi[k];
                    grad_phi[k] += g * self.rel_cls_w.data[base + k];
                }
            }

            for d in 0..dim {
                let sign = if h[d] >= t[d] { 1.0 } else { -1.0 };
                let gh = grad_phi[d] + grad_phi[2 * dim + d] * t[d] + grad_phi[3 * dim + d] * sign;
                let gt = grad_phi[dim + d] + grad_phi[2 * dim + d] * h[d] - grad_phi[3 * dim + d] * sign;
                grad_out[hs * dim + d] += gh;
                grad_out[ts * dim + d] += gt;
            }
        }
        if !positives.is_empty() {
            loss /= positives.len() as f32;
        }
        if out.skipped_positives > 0 {
            debug!(skipped = out.skipped_positives, "relation loss skipped positives");
        }
        out.loss = loss;
        out
    }

    /// Classifier parameters in checkpoint order: `rel_cls_w`, `rel_cls_b`.
    pub fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.rel_cls_w, &self.rel_cls_b]
    }

    /// Mutable classifier parameters in checkpoint order.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.rel_cls_w, &mut self.rel_cls_b]
    }

    /// `R`.
    pub fn num_relations(&self) -> usize {
        self.num_relations
    }

    /// Embedding width the classifier expects.
    pub fn dim(&self) -> usize {
        self.dim
    }
}
