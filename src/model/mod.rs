//! Encoder/decoder networks with hand-written gradients, the optimizer, and
//! the checkpoint codec.
//!
//! Parameters live in plain [`Parameter`] buffers. The encoder owns the
//! relation-embedding table and lends it mutably to the decoder for each
//! loss computation, so there is exactly one owner for every buffer.

/// Binary checkpoint save/load.
pub mod checkpoint;
/// Link-scoring and relation-classification heads.
pub mod decoder;
/// Multi-layer neighbor-aggregation encoder.
pub mod encoder;
/// Raw per-node features.
pub mod features;
/// SGD and Adam.
pub mod optim;
/// Float buffers with gradient accumulators.
pub mod params;

pub use checkpoint::{
    assign_parameters, load_checkpoint, save_checkpoint, AssignReport, Checkpoint,
    CheckpointMeta, CheckpointReport,
};
pub use decoder::{Decoder, LossOutput};
pub use encoder::{Encoder, EncoderConfig, EncoderState};
pub use features::{compute_base_features, feature_dim, FeatureConfig};
pub use optim::{OptimConfig, Optimizer};
pub use params::Parameter;
