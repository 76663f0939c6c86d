#![allow(missing_docs)]

use relsage::{
    eval::{evaluate_link_prediction, rank_tails, EmbeddingCache, TrueTails},
    model::{Encoder, EncoderConfig, FeatureConfig, OptimConfig, Optimizer},
    primitives::XorShift128Plus,
    sampling::sample_negative,
    storage::{build_reverse, CsrBuilder, CsrGraph, Triple},
    train::{Model, OptimizerKind, TrainOptions, Trainer},
    types::{NodeId, Result},
};
use tempfile::{tempdir, TempDir};

fn cycle() -> Result<(TempDir, CsrGraph)> {
    let dir = tempdir()?;
    let mut b = CsrBuilder::new(3, 1);
    b.add_edge(1, 1, 2).add_edge(2, 1, 3).add_edge(3, 1, 1);
    b.write(dir.path())?;
    let g = CsrGraph::load(dir.path())?;
    Ok((dir, g))
}

/// Two relation types over six nodes: `1` links `i -> i+1`, `2` links
/// `i -> i+2`, both wrapping.
fn ring() -> Result<(TempDir, CsrGraph, CsrGraph, Vec<Triple>)> {
    let dir = tempdir()?;
    let n = 6u32;
    let mut b = CsrBuilder::new(n, 2);
    let mut triples = Vec::new();
    for v in 1..=n {
        let next = v % n + 1;
        let skip = (v + 1) % n + 1;
        b.add_edge(v, 1, next).add_edge(v, 2, skip);
        triples.push(Triple::new(v, 1, next));
        triples.push(Triple::new(v, 2, skip));
    }
    b.write(dir.path())?;
    let g = CsrGraph::load(dir.path())?;
    build_reverse(&g).write(dir.path())?;
    let rev = CsrGraph::load_reverse(dir.path())?;
    Ok((dir, g, rev, triples))
}

fn small_options() -> TrainOptions {
    TrainOptions {
        epochs: 2,
        batch_size: 4,
        hidden_dim: 8,
        layers: 1,
        fanouts: vec![2],
        negatives: 2,
        lr: 0.01,
        seed: 17,
        ..TrainOptions::default()
    }
}

#[test]
fn forward_embeds_every_seed_once() -> Result<()> {
    let (_dir, g) = cycle()?;
    let config = EncoderConfig {
        hidden_dim: 8,
        layers: 1,
        fanouts: vec![1],
        use_relu: true,
    };
    let features = FeatureConfig {
        use_in_degree: false,
        add_noise: false,
    };
    let encoder = Encoder::new(1, 1, config, features, &mut XorShift128Plus::from_seed(1))?;
    let state = encoder.forward(&g, None, &[1, 2, 3, 2], &mut XorShift128Plus::from_seed(2));

    assert_eq!(state.output().len(), 3 * 8);
    let mut slots: Vec<usize> = [1, 2, 3]
        .iter()
        .map(|&v| state.top_index().slot(v).unwrap())
        .collect();
    slots.sort_unstable();
    assert_eq!(slots, vec![0, 1, 2]);
    assert!(state.embedding(4).is_none());
    assert!(state.output().iter().all(|x| x.is_finite() && *x >= 0.0));
    Ok(())
}

fn batch_loss(
    model: &mut Model,
    graph: &CsrGraph,
    positives: &[Triple],
    negatives: &[NodeId],
    backward: bool,
) -> f32 {
    let seeds: Vec<NodeId> = positives
        .iter()
        .flat_map(|t| [t.head, t.tail])
        .chain(negatives.iter().copied())
        .collect();
    let k = negatives.len() / positives.len();
    let state = model
        .encoder
        .forward(graph, None, &seeds, &mut XorShift128Plus::from_seed(99));
    let mut grad = state.output_grad();
    let link = model.decoder.distmult_loss(
        model.encoder.relation_embeddings_mut(),
        positives,
        negatives,
        k,
        state.top_index(),
        state.output(),
        &mut grad,
    );
    let rel = model
        .decoder
        .relation_loss(positives, state.top_index(), state.output(), &mut grad, 1.0);
    if backward {
        model.encoder.backward(&state, grad);
    }
    link.loss + rel.loss
}

#[test]
fn sgd_step_does_not_raise_the_batch_loss() -> Result<()> {
    let (_dir, g, _rev, triples) = ring()?;
    let options = TrainOptions {
        use_in_degree: false,
        optimizer: OptimizerKind::Sgd,
        ..small_options()
    };
    let mut model = Model::new(&options, 2, false, &mut XorShift128Plus::from_seed(5))?;
    let positives = &triples[..4];
    let negatives = [4, 6, 5, 1, 6, 2, 3, 1];

    model.zero_grad();
    let before = batch_loss(&mut model, &g, positives, &negatives, true);
    let mut optimizer = Optimizer::new(
        OptimConfig {
            lr: 0.01,
            use_adam: false,
            ..OptimConfig::default()
        },
        &model.parameters(),
    );
    optimizer.step(&mut model.parameters_mut())?;
    let after = batch_loss(&mut model, &g, positives, &negatives, false);

    assert!(before.is_finite() && after.is_finite());
    assert!(after <= before + 1e-3, "loss rose from {before} to {after}");
    assert_eq!(optimizer.step_count(), 1);
    Ok(())
}

#[test]
fn negatives_stay_in_range_and_may_hit_the_tail() {
    let mut rng = XorShift128Plus::from_seed(3);
    let draws: Vec<NodeId> = (0..400).map(|_| sample_negative(3, &mut rng)).collect();
    assert!(draws.iter().all(|v| (1..=3).contains(v)));
    assert!(draws.contains(&2), "the true tail is not excluded");
}

#[test]
fn epoch_runs_one_step_per_batch() -> Result<()> {
    let (_dir, g, rev, triples) = ring()?;
    let mut trainer = Trainer::new(&g, Some(&rev), small_options())?;
    let mut steps = Vec::new();
    let report = trainer.train_epoch(&triples, 1, |s| steps.push(*s))?;

    assert_eq!(report.batches, 3);
    assert_eq!(steps.len(), 3);
    assert_eq!(trainer.optimizer().step_count(), 3);
    assert!(steps.iter().all(|s| s.positives == 4 && s.skipped_positives == 0));
    assert!(report.loss.is_finite() && report.loss > 0.0);
    let mean = steps.iter().map(|s| s.loss).sum::<f32>() / 3.0;
    assert!((report.loss - mean).abs() < 1e-5);
    Ok(())
}

#[test]
fn same_seed_trains_identical_models() -> Result<()> {
    let (_dir, g, rev, triples) = ring()?;
    let run = || -> Result<Vec<Vec<u32>>> {
        let mut trainer = Trainer::new(&g, Some(&rev), small_options())?;
        trainer.fit(&triples, |_| {})?;
        Ok(trainer
            .model()
            .parameters()
            .iter()
            .map(|p| p.data.iter().map(|x| x.to_bits()).collect())
            .collect())
    };
    assert_eq!(run()?, run()?);
    Ok(())
}

#[test]
fn trained_model_evaluates_and_ranks() -> Result<()> {
    let (_dir, g, rev, triples) = ring()?;
    let mut trainer = Trainer::new(&g, Some(&rev), small_options())?;
    let fit = trainer.fit(&triples, |_| {})?;
    assert_eq!(fit.epochs.len(), 2);
    assert!(fit.checkpoint.is_none());
    let model = trainer.into_model();

    let cache = EmbeddingCache::build(&model.encoder, &g, Some(&rev), 4, 99)?;
    assert_eq!(cache.num_nodes(), 6);
    let rel_emb = &model.encoder.relation_embeddings().data;
    let eval = [Triple::new(1, 1, 2), Triple::new(4, 2, 6), Triple::new(0, 1, 2)];
    let filter = TrueTails::from_sets([triples.as_slice()]);
    let report = evaluate_link_prediction(&cache, rel_emb, &eval, &filter);

    assert_eq!(report.metrics.count, 2);
    assert_eq!(report.skipped, 1);
    let m = report.metrics;
    assert!(m.mrr > 0.0 && m.mrr <= 1.0);
    assert!(m.hits1 <= m.hits3 && m.hits3 <= m.hits10 && m.hits10 <= m.hits100);
    assert_eq!(m.hits100, 1.0);

    let ranking = rank_tails(&cache, rel_emb, &Triple::new(1, 1, 2), 3).unwrap();
    assert_eq!(ranking.top.len(), 3);
    assert!(ranking.top.windows(2).all(|w| w[0].score >= w[1].score));
    let rank = ranking.rank.unwrap();
    assert!((1..=6).contains(&rank));
    Ok(())
}
