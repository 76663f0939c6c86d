use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::primitives::mix_seed;
use crate::storage::CsrGraph;
use crate::types::NodeId;

/// Which raw per-node features the encoder consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Emit `log1p(in_degree)` as a second feature.
    pub use_in_degree: bool,
    /// Perturb every feature with deterministic per-node noise.
    pub add_noise: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            use_in_degree: true,
            add_noise: false,
        }
    }
}

impl FeatureConfig {
    /// Normalizes the configuration for the graphs actually available.
    ///
    /// In-degree needs the reverse graph; requesting it without one turns
    /// the flag off with a warning instead of emitting a constant column.
    pub fn resolve(mut self, has_reverse: bool) -> Self {
        if self.use_in_degree && !has_reverse {
            warn!("in-degree feature requested without a reverse graph; disabling it");
            self.use_in_degree = false;
        }
        self
    }

    /// Width of the raw feature vector this configuration produces.
    pub fn dim(&self) -> usize {
        1 + usize::from(self.use_in_degree)
    }
}

/// `1` (out-degree) or `2` (out- and in-degree) once `config` is resolved
/// against the presence of a reverse graph.
pub fn feature_dim(config: &FeatureConfig, has_reverse: bool) -> usize {
    config.resolve(has_reverse).dim()
}

/// Noise in `[-0.01, 0.01)` derived from the node id alone.
#[inline]
pub fn node_noise(v: NodeId) -> f32 {
    noise_from_bits(mix_seed(u64::from(v)) & 0xFFFF)
}

fn noise_from_bits(bits: u64) -> f32 {
    ((bits as f64 / 65536.0 - 0.5) as f32) * 0.02
}

/// Row-major `nodes.len() x dim` feature matrix.
///
/// Column 0 is `log1p(out_degree)`. Column 1, when `dim > 1`, is
/// `log1p(in_degree)` if in-degree is enabled and `reverse` is present, else
/// 0. Out-of-range ids read as degree 0.
pub fn compute_base_features(
    graph: &CsrGraph,
    reverse: Option<&CsrGraph>,
    nodes: &[NodeId],
    config: &FeatureConfig,
    dim: usize,
) -> Vec<f32> {
    let mut out = vec![0.0f32; nodes.len() * dim];
    if dim == 0 {
        return out;
    }
    for (row, &v) in out.chunks_exact_mut(dim).zip(nodes) {
        row[0] = (graph.out_degree(v) as f32).ln_1p();
        if dim > 1 && config.use_in_degree {
            if let Some(rev) = reverse {
                row[1] = (rev.out_degree(v) as f32).ln_1p();
            }
        }
        if config.add_noise {
            let noise = node_noise(v);
            for x in row.iter_mut() {
                *x += noise;
            }
        }
    }
    out
}
