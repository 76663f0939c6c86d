//! Minibatch training loop: negative sampling, both loss heads, backward,
//! optimizer step, and periodic checkpoints.

/// Hyper-parameters and their TOML loader.
pub mod options;

use std::path::Path;
use std::time::Instant;

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::model::{
    assign_parameters, save_checkpoint, AssignReport, Checkpoint, CheckpointReport, Decoder,
    Encoder, Optimizer, Parameter,
};
use crate::primitives::XorShift128Plus;
use crate::sampling::sample_negative;
use crate::storage::{CsrGraph, Triple};
use crate::types::{KgError, NodeId, Result};

pub use options::{default_config_path, ConfigError, OptimizerKind, TrainOptions};

/// Encoder and decoder trained together.
#[derive(Clone, Debug)]
pub struct Model {
    /// Neighbor-aggregation encoder; owns the relation table.
    pub encoder: Encoder,
    /// Link and relation heads.
    pub decoder: Decoder,
}

impl Model {
    /// Draws a fresh model from `rng`: encoder first, then decoder.
    pub fn new(
        options: &TrainOptions,
        num_relations: usize,
        has_reverse: bool,
        rng: &mut XorShift128Plus,
    ) -> Result<Self> {
        let features = options.feature_config().resolve(has_reverse);
        let encoder = Encoder::new(
            features.dim(),
            num_relations,
            options.encoder_config(),
            features,
            rng,
        )?;
        let decoder = Decoder::new(num_relations, encoder.output_dim(), rng);
        Ok(Self { encoder, decoder })
    }

    /// Rebuilds the model described by `checkpoint` and copies its buffers
    /// in positionally.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<(Self, AssignReport)> {
        let meta = &checkpoint.meta;
        let mut rng = XorShift128Plus::default();
        let encoder = Encoder::new(
            meta.feature_dim,
            meta.num_relations,
            meta.encoder.clone(),
            meta.features,
            &mut rng,
        )?;
        let decoder = Decoder::new(meta.num_relations, encoder.output_dim(), &mut rng);
        let mut model = Self { encoder, decoder };
        let report = assign_parameters(&checkpoint.params, &mut model.parameters_mut())?;
        Ok((model, report))
    }

    /// Every parameter, encoder then decoder.
    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut ps = self.encoder.parameters();
        ps.extend(self.decoder.parameters());
        ps
    }

    /// Mutable parameters in the same order as [`Model::parameters`].
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut ps = self.encoder.parameters_mut();
        ps.extend(self.decoder.parameters_mut());
        ps
    }

    /// Clears every gradient buffer.
    pub fn zero_grad(&mut self) {
        Optimizer::zero_grad(&mut self.parameters_mut());
    }

    /// Writes a checkpoint; Adam moments are included when `optimizer` keeps
    /// them.
    pub fn save(
        &self,
        path: impl AsRef<Path>,
        optimizer: Option<&Optimizer>,
    ) -> Result<CheckpointReport> {
        save_checkpoint(path, &self.encoder, &self.decoder, optimizer)
    }
}

/// Outcome of one optimizer step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StepReport {
    /// Link loss plus weighted relation loss.
    pub loss: f32,
    /// DistMult loss alone.
    pub link_loss: f32,
    /// Weighted relation-classification loss alone.
    pub rel_loss: f32,
    /// Positives in the batch.
    pub positives: usize,
    /// Distinct seed nodes embedded for the batch.
    pub seeds: usize,
    /// Positives the link head could not score.
    pub skipped_positives: usize,
    /// Negatives the link head could not score.
    pub skipped_negatives: usize,
    /// Positives the relation head classified.
    pub rel_scored: usize,
    /// Positives the relation head dropped: missing ids or a relation id
    /// outside `1..=R`.
    pub rel_skipped_positives: usize,
}

/// Summary of one pass over the training triples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct EpochReport {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Optimizer steps taken.
    pub batches: usize,
    /// Mean of per-batch total loss.
    pub loss: f32,
    /// Mean of per-batch link loss.
    pub link_loss: f32,
    /// Mean of per-batch relation loss.
    pub rel_loss: f32,
    /// Sum of skipped positives over the epoch.
    pub skipped_positives: usize,
    /// Sum of positives the relation head dropped over the epoch.
    pub rel_skipped_positives: usize,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
}

/// Everything [`Trainer::fit`] produced.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FitReport {
    /// One entry per epoch.
    pub epochs: Vec<EpochReport>,
    /// The last checkpoint written, if any.
    pub checkpoint: Option<CheckpointReport>,
}

/// Drives training over a borrowed forward graph and optional reverse graph.
///
/// One random stream, seeded from the options, feeds initialization,
/// shuffling, negative draws and neighbor sampling in that order.
pub struct Trainer<'g> {
    graph: &'g CsrGraph,
    reverse: Option<&'g CsrGraph>,
    model: Model,
    optimizer: Optimizer,
    options: TrainOptions,
    rng: XorShift128Plus,
}

impl<'g> Trainer<'g> {
    /// Validates `options` and initializes a fresh model.
    pub fn new(
        graph: &'g CsrGraph,
        reverse: Option<&'g CsrGraph>,
        options: TrainOptions,
    ) -> Result<Self> {
        options.validate()?;
        let mut rng = XorShift128Plus::from_seed(options.seed);
        let model = Model::new(
            &options,
            graph.num_relations() as usize,
            reverse.is_some(),
            &mut rng,
        )?;
        let optimizer = Optimizer::new(options.optim_config(), &model.parameters());
        info!(
            nodes = graph.num_nodes(),
            edges = graph.num_edges(),
            relations = graph.num_relations(),
            params = model.parameters().iter().map(|p| p.len()).sum::<usize>(),
            reverse = reverse.is_some(),
            "trainer ready"
        );
        Ok(Self {
            graph,
            reverse,
            model,
            optimizer,
            options,
            rng,
        })
    }

    /// Continues from `checkpoint`. The model shape comes from the
    /// checkpoint; the optimizer settings and seed from `options`. Adam
    /// moments are restored when both sides use Adam.
    pub fn resume(
        graph: &'g CsrGraph,
        reverse: Option<&'g CsrGraph>,
        options: TrainOptions,
        checkpoint: &Checkpoint,
    ) -> Result<Self> {
        options.validate()?;
        let meta = &checkpoint.meta;
        if meta.num_relations != graph.num_relations() as usize {
            return Err(KgError::InvalidConfig(format!(
                "checkpoint has {} relations, graph has {}",
                meta.num_relations,
                graph.num_relations()
            )));
        }
        let (model, assigned) = Model::from_checkpoint(checkpoint)?;
        if assigned.skipped_shape > 0 {
            warn!(skipped = assigned.skipped_shape, "resumed with freshly initialized buffers");
        }
        let mut optimizer = Optimizer::new(options.optim_config(), &model.parameters());
        if !optimizer.uses_adam() {
            optimizer.set_state(Vec::new(), Vec::new(), meta.step)?;
        } else if meta.use_adam {
            optimizer.set_state(checkpoint.m.clone(), checkpoint.v.clone(), meta.step)?;
        } else {
            debug!("checkpoint carries no moments; adam starts cold");
        }
        info!(step = meta.step, adam = meta.use_adam, "resumed from checkpoint");
        let rng = XorShift128Plus::new(options.seed, meta.step);
        Ok(Self {
            graph,
            reverse,
            model,
            optimizer,
            options,
            rng,
        })
    }

    /// One optimizer step on `batch`.
    ///
    /// Draws `negatives` corrupted tails per positive, embeds heads, tails
    /// and negatives together, and backpropagates the sum of both losses.
    pub fn train_step(&mut self, batch: &[Triple]) -> Result<StepReport> {
        let k = self.options.negatives;
        let num_nodes = self.graph.num_nodes();
        let negatives: Vec<NodeId> = (0..batch.len() * k)
            .map(|_| sample_negative(num_nodes, &mut self.rng))
            .collect();
        let seeds: Vec<NodeId> = batch
            .iter()
            .flat_map(|t| [t.head, t.tail])
            .chain(negatives.iter().copied())
            .collect();

        self.model.zero_grad();
        let state = self
            .model
            .encoder
            .forward(self.graph, self.reverse, &seeds, &mut self.rng);
        let mut grad = state.output_grad();
        let link = self.model.decoder.distmult_loss(
            self.model.encoder.relation_embeddings_mut(),
            batch,
            &negatives,
            k,
            state.top_index(),
            state.output(),
            &mut grad,
        );
        let rel = self.model.decoder.relation_loss(
            batch,
            state.top_index(),
            state.output(),
            &mut grad,
            self.options.lambda_rel,
        );
        self.model.encoder.backward(&state, grad);
        self.optimizer.step(&mut self.model.parameters_mut())?;

        if link.skipped_positives > 0 {
            warn!(
                skipped = link.skipped_positives,
                batch = batch.len(),
                "positives missing from the batch embeddings"
            );
        }
        if rel.skipped_positives > 0 {
            warn!(
                skipped = rel.skipped_positives,
                batch = batch.len(),
                "positives the relation head could not classify"
            );
        }
        Ok(StepReport {
            loss: link.loss + rel.loss,
            link_loss: link.loss,
            rel_loss: rel.loss,
            positives: batch.len(),
            seeds: state.top_index().len(),
            skipped_positives: link.skipped_positives,
            skipped_negatives: link.skipped_negatives,
            rel_scored: rel.scored,
            rel_skipped_positives: rel.skipped_positives,
        })
    }

    /// Shuffles `triples` and runs one step per batch. `on_step` sees every
    /// step report.
    pub fn train_epoch(
        &mut self,
        triples: &[Triple],
        epoch: usize,
        mut on_step: impl FnMut(&StepReport),
    ) -> Result<EpochReport> {
        let start = Instant::now();
        let mut order: Vec<usize> = (0..triples.len()).collect();
        order.shuffle(&mut self.rng);

        let mut report = EpochReport {
            epoch,
            ..EpochReport::default()
        };
        let mut batch = Vec::with_capacity(self.options.batch_size);
        for chunk in order.chunks(self.options.batch_size) {
            batch.clear();
            batch.extend(chunk.iter().map(|&i| triples[i]));
            let step = self.train_step(&batch)?;
            report.batches += 1;
            report.loss += step.loss;
            report.link_loss += step.link_loss;
            report.rel_loss += step.rel_loss;
            report.skipped_positives += step.skipped_positives;
            report.rel_skipped_positives += step.rel_skipped_positives;
            on_step(&step);
        }
        if report.batches > 0 {
            let n = report.batches as f32;
            report.loss /= n;
            report.link_loss /= n;
            report.rel_loss /= n;
        }
        report.duration_ms = start.elapsed().as_secs_f64() * 1_000.0;
        info!(
            epoch,
            batches = report.batches,
            loss = report.loss,
            link_loss = report.link_loss,
            rel_loss = report.rel_loss,
            ms = report.duration_ms,
            "epoch finished"
        );
        Ok(report)
    }

    /// Runs every configured epoch, saving to the checkpoint path every
    /// `checkpoint_every` epochs and once at the end.
    pub fn fit(
        &mut self,
        triples: &[Triple],
        mut on_step: impl FnMut(&StepReport),
    ) -> Result<FitReport> {
        let mut report = FitReport::default();
        let epochs = self.options.epochs;
        for epoch in 1..=epochs {
            report.epochs.push(self.train_epoch(triples, epoch, &mut on_step)?);
            let every = self.options.checkpoint_every;
            if every > 0 && epoch % every == 0 && epoch < epochs {
                report.checkpoint = self.save_configured()?;
            }
        }
        if let Some(saved) = self.save_configured()? {
            report.checkpoint = Some(saved);
        }
        Ok(report)
    }

    fn save_configured(&self) -> Result<Option<CheckpointReport>> {
        match &self.options.checkpoint {
            Some(path) => self.save(path).map(Some),
            None => Ok(None),
        }
    }

    /// Writes the model and optimizer state to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<CheckpointReport> {
        self.model.save(path, Some(&self.optimizer))
    }

    /// The model being trained.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The optimizer and its step counter.
    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    /// Validated options.
    pub fn options(&self) -> &TrainOptions {
        &self.options
    }

    /// Consumes the trainer, keeping the model.
    pub fn into_model(self) -> Model {
        self.model
    }
}
