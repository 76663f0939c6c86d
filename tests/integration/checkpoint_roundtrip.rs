#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;

use relsage::{
    model::{assign_parameters, load_checkpoint, Parameter},
    storage::{CsrBuilder, CsrGraph, Triple},
    train::{Model, OptimizerKind, TrainOptions, Trainer},
    types::{KgError, Result},
};
use tempfile::{tempdir, TempDir};

fn graph(relations: u32) -> Result<(TempDir, CsrGraph, Vec<Triple>)> {
    let dir = tempdir()?;
    let mut b = CsrBuilder::new(5, relations);
    let mut triples = Vec::new();
    for v in 1..=5u32 {
        let rel = (v % relations + 1) as u16;
        let dst = v % 5 + 1;
        b.add_edge(v, rel, dst);
        triples.push(Triple::new(v, u32::from(rel), dst));
    }
    b.write(dir.path())?;
    let g = CsrGraph::load(dir.path())?;
    Ok((dir, g, triples))
}

fn options(dir: &TempDir) -> TrainOptions {
    TrainOptions {
        epochs: 2,
        batch_size: 2,
        hidden_dim: 6,
        layers: 2,
        fanouts: vec![2, 2],
        negatives: 1,
        lr: 0.01,
        seed: 4,
        checkpoint: Some(dir.path().join("ckpt").join("model.bin")),
        ..TrainOptions::default()
    }
}

fn bits(params: &[&Parameter]) -> Vec<Vec<u32>> {
    params
        .iter()
        .map(|p| p.data.iter().map(|x| x.to_bits()).collect())
        .collect()
}

#[test]
fn trained_state_survives_save_and_load() -> Result<()> {
    let (dir, g, triples) = graph(2)?;
    let opts = options(&dir);
    let path = opts.checkpoint.clone().unwrap();
    let mut trainer = Trainer::new(&g, None, opts)?;
    let fit = trainer.fit(&triples, |_| {})?;

    let saved = fit.checkpoint.expect("final save");
    assert_eq!(saved.path, path);
    assert_eq!(saved.step, 6);
    assert!(saved.use_adam);
    assert_eq!(saved.bytes, fs::metadata(&path)?.len());

    let ckpt = load_checkpoint(&path)?;
    assert_eq!(ckpt.meta.step, trainer.optimizer().step_count());
    assert_eq!(ckpt.m, trainer.optimizer().m());
    assert_eq!(ckpt.v, trainer.optimizer().v());

    let (model, report) = Model::from_checkpoint(&ckpt)?;
    assert_eq!(report.skipped_shape, 0);
    assert_eq!(report.assigned, model.parameters().len());
    assert_eq!(
        bits(&model.parameters()),
        bits(&trainer.model().parameters())
    );
    Ok(())
}

#[test]
fn resume_continues_the_step_counter() -> Result<()> {
    let (dir, g, triples) = graph(2)?;
    let opts = options(&dir);
    let path = opts.checkpoint.clone().unwrap();
    Trainer::new(&g, None, opts.clone())?.fit(&triples, |_| {})?;

    let ckpt = load_checkpoint(&path)?;
    let mut resumed = Trainer::resume(&g, None, opts, &ckpt)?;
    assert_eq!(resumed.optimizer().step_count(), 6);
    assert_eq!(resumed.optimizer().m(), ckpt.m.as_slice());
    resumed.train_epoch(&triples, 3, |_| {})?;
    assert_eq!(resumed.optimizer().step_count(), 9);
    Ok(())
}

#[test]
fn sgd_checkpoint_has_no_moments() -> Result<()> {
    let (dir, g, triples) = graph(2)?;
    let opts = TrainOptions {
        optimizer: OptimizerKind::Sgd,
        epochs: 1,
        ..options(&dir)
    };
    let path = opts.checkpoint.clone().unwrap();
    Trainer::new(&g, None, opts.clone())?.fit(&triples, |_| {})?;

    let ckpt = load_checkpoint(&path)?;
    assert!(!ckpt.meta.use_adam);
    assert!(ckpt.m.is_empty() && ckpt.v.is_empty());

    let adam = TrainOptions {
        optimizer: OptimizerKind::Adam,
        ..opts
    };
    let resumed = Trainer::resume(&g, None, adam, &ckpt)?;
    assert_eq!(resumed.optimizer().step_count(), 0);
    assert!(resumed.optimizer().m().iter().flatten().all(|&x| x == 0.0));
    Ok(())
}

#[test]
fn resume_rejects_a_graph_with_other_relations() -> Result<()> {
    let (dir, g, triples) = graph(2)?;
    let opts = options(&dir);
    let path = opts.checkpoint.clone().unwrap();
    Trainer::new(&g, None, opts.clone())?.fit(&triples, |_| {})?;
    let ckpt = load_checkpoint(&path)?;

    let (_other_dir, other, _) = graph(3)?;
    assert!(matches!(
        Trainer::resume(&other, None, opts, &ckpt),
        Err(KgError::InvalidConfig(_))
    ));
    Ok(())
}

#[test]
fn shape_mismatches_are_counted_not_fatal() -> Result<()> {
    let (dir, g, _) = graph(2)?;
    let trainer = Trainer::new(&g, None, options(&dir))?;
    let mut model = trainer.into_model();
    let mut data: Vec<Vec<f32>> = model.parameters().iter().map(|p| p.data.clone()).collect();
    data[0].push(1.0);
    data[2].clear();

    let report = assign_parameters(&data, &mut model.parameters_mut())?;
    assert_eq!(report.skipped_shape, 2);
    assert_eq!(report.assigned, data.len() - 2);

    data.pop();
    assert!(matches!(
        assign_parameters(&data, &mut model.parameters_mut()),
        Err(KgError::StateMismatch { .. })
    ));
    Ok(())
}

#[test]
fn damaged_files_are_rejected() -> Result<()> {
    let (dir, g, _) = graph(2)?;
    let trainer = Trainer::new(&g, None, options(&dir))?;
    let path = dir.path().join("fresh.bin");
    trainer.save(&path)?;
    let full = fs::read(&path)?;

    let cut = dir.path().join("cut.bin");
    fs::write(&cut, &full[..full.len() - 3])?;
    assert!(matches!(
        load_checkpoint(&cut),
        Err(KgError::Truncated { .. })
    ));

    assert!(matches!(
        load_checkpoint(dir.path().join("absent.bin")),
        Err(KgError::MissingFile { .. })
    ));

    // Trailing bytes are tolerated.
    OpenOptions::new().append(true).open(&path)?.write_all(&[0xAB; 5])?;
    let ckpt = load_checkpoint(&path)?;
    assert_eq!(ckpt.params.len(), trainer.model().parameters().len());
    Ok(())
}
