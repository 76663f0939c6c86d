//! Relational GraphSAGE embeddings over a memory-mapped CSR graph.
//!
//! The crate trains a multi-layer neighbor-aggregation encoder whose
//! messages carry a learned relation embedding, scored by a DistMult link
//! head and a relation classifier. Graphs are read zero-copy from flat
//! binary arrays; models are saved to a single binary checkpoint.
//!
//! ```no_run
//! use relsage::{CsrGraph, TrainOptions, Trainer, TripleFile};
//!
//! # fn main() -> relsage::Result<()> {
//! let graph = CsrGraph::load("data/graph")?;
//! let triples = TripleFile::open("data/train.bin")?;
//! let mut trainer = Trainer::new(&graph, None, TrainOptions::default())?;
//! let report = trainer.fit(triples.as_slice(), |_| {})?;
//! println!("final loss {}", report.epochs.last().map_or(0.0, |e| e.loss));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod eval;
pub mod model;
pub mod primitives;
pub mod sampling;
pub mod storage;
pub mod train;
pub mod types;

pub use eval::{
    evaluate_link_prediction, rank_relations, rank_tails, EmbeddingCache, LinkPredictionReport,
    RankMetrics, Ranking, Scored, TrueTails,
};
pub use model::{
    load_checkpoint, save_checkpoint, Checkpoint, Decoder, Encoder, EncoderConfig, FeatureConfig,
    OptimConfig, Optimizer,
};
pub use primitives::XorShift128Plus;
pub use storage::{build_reverse, CsrBuilder, CsrGraph, Triple, TripleFile};
pub use train::{Model, TrainOptions, Trainer};
pub use types::{KgError, NodeId, RelId, Result};
