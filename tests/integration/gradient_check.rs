#![allow(missing_docs)]

//! Finite-difference checks of the hand-written backward passes.
//!
//! Losses report the batch mean while gradients are of the summed loss, so
//! every numeric derivative here is taken of `loss * batch_len`.

use relsage::{
    model::{Decoder, Encoder, EncoderConfig, FeatureConfig, Parameter},
    primitives::XorShift128Plus,
    sampling::LayerIndex,
    storage::{CsrBuilder, CsrGraph, Triple},
    types::{NodeId, Result},
};
use tempfile::{tempdir, TempDir};

const SAMPLE_SEED: u64 = 0x5eed;
const NEG_PER_POS: usize = 2;
const POSITIVES: [Triple; 3] = [Triple::new(1, 1, 2), Triple::new(4, 2, 5), Triple::new(3, 2, 4)];
const NEGATIVES: [NodeId; 6] = [3, 5, 1, 2, 5, 1];

fn close(analytic: f32, numeric: f32) -> bool {
    let scale = analytic.abs().max(numeric.abs());
    (analytic - numeric).abs() <= 1e-3 + 0.05 * scale
}

fn probe_indices(len: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..5).map(|k| k * len / 5).collect();
    idx.push(len - 1);
    idx.dedup();
    idx
}

fn graph() -> Result<(TempDir, CsrGraph)> {
    let dir = tempdir()?;
    let mut b = CsrBuilder::new(5, 2);
    b.add_edge(1, 1, 2)
        .add_edge(1, 2, 3)
        .add_edge(1, 1, 5)
        .add_edge(2, 1, 3)
        .add_edge(3, 2, 4)
        .add_edge(4, 1, 1)
        .add_edge(4, 2, 5)
        .add_edge(5, 1, 2);
    b.write(dir.path())?;
    let g = CsrGraph::load(dir.path())?;
    Ok((dir, g))
}

fn seeds() -> Vec<NodeId> {
    POSITIVES
        .iter()
        .flat_map(|t| [t.head, t.tail])
        .chain(NEGATIVES)
        .collect()
}

fn link_loss(encoder: &mut Encoder, decoder: &Decoder, graph: &CsrGraph) -> f32 {
    let mut rng = XorShift128Plus::from_seed(SAMPLE_SEED);
    let state = encoder.forward(graph, None, &seeds(), &mut rng);
    let mut grad = state.output_grad();
    let out = decoder.distmult_loss(
        encoder.relation_embeddings_mut(),
        &POSITIVES,
        &NEGATIVES,
        NEG_PER_POS,
        state.top_index(),
        state.output(),
        &mut grad,
    );
    assert_eq!(out.scored, POSITIVES.len());
    out.loss * POSITIVES.len() as f32
}

fn set_encoder_value(encoder: &mut Encoder, param: usize, index: usize, value: f32) {
    let mut params = encoder.parameters_mut();
    params[param].data[index] = value;
}

fn encoder_numeric(
    encoder: &mut Encoder,
    decoder: &Decoder,
    graph: &CsrGraph,
    param: usize,
    index: usize,
    eps: f32,
) -> f32 {
    let original = encoder.parameters()[param].data[index];
    set_encoder_value(encoder, param, index, original + eps);
    let plus = link_loss(encoder, decoder, graph);
    set_encoder_value(encoder, param, index, original - eps);
    let minus = link_loss(encoder, decoder, graph);
    set_encoder_value(encoder, param, index, original);
    (plus - minus) / (2.0 * eps)
}

fn check_encoder_gradients(use_relu: bool) -> Result<()> {
    let (_dir, g) = graph()?;
    let config = EncoderConfig {
        hidden_dim: 4,
        layers: 2,
        fanouts: vec![2, 2],
        use_relu,
    };
    let features = FeatureConfig {
        use_in_degree: false,
        add_noise: true,
    };
    let mut init = XorShift128Plus::from_seed(7);
    let mut encoder = Encoder::new(1, 2, config, features, &mut init)?;
    let decoder = Decoder::new(2, 4, &mut init);
    for p in encoder.parameters_mut() {
        for x in &mut p.data {
            *x *= 20.0;
        }
    }

    for p in encoder.parameters_mut() {
        p.zero_grad();
    }
    let mut rng = XorShift128Plus::from_seed(SAMPLE_SEED);
    let state = encoder.forward(&g, None, &seeds(), &mut rng);
    let mut grad = state.output_grad();
    decoder.distmult_loss(
        encoder.relation_embeddings_mut(),
        &POSITIVES,
        &NEGATIVES,
        NEG_PER_POS,
        state.top_index(),
        state.output(),
        &mut grad,
    );
    encoder.backward(&state, grad);
    let analytic: Vec<(String, Vec<f32>)> = encoder
        .parameters()
        .iter()
        .map(|p| (p.name().to_string(), p.grad.clone()))
        .collect();
    assert!(
        analytic.iter().any(|(_, g)| g.iter().any(|x| x.abs() > 1e-4)),
        "gradients vanished; the check would be vacuous"
    );

    for (pi, (name, grads)) in analytic.iter().enumerate() {
        for j in probe_indices(grads.len()) {
            let mut numeric = encoder_numeric(&mut encoder, &decoder, &g, pi, j, 1e-2);
            if !close(grads[j], numeric) {
                numeric = encoder_numeric(&mut encoder, &decoder, &g, pi, j, 2.5e-3);
            }
            assert!(
                close(grads[j], numeric),
                "{name}[{j}] (relu={use_relu}): analytic {} numeric {numeric}",
                grads[j]
            );
        }
    }
    Ok(())
}

#[test]
fn encoder_gradients_match_finite_differences() -> Result<()> {
    check_encoder_gradients(false)
}

#[test]
fn relu_encoder_gradients_match_finite_differences() -> Result<()> {
    check_encoder_gradients(true)
}

const EMB_DIM: usize = 4;
const DECODER_POSITIVES: [Triple; 3] =
    [Triple::new(1, 1, 2), Triple::new(2, 2, 3), Triple::new(3, 1, 1)];
const DECODER_NEGATIVES: [NodeId; 3] = [3, 1, 2];

fn embeddings() -> Vec<f32> {
    vec![
        0.5, -0.3, 0.2, 0.9, //
        -0.4, 0.6, -0.5, 0.1, //
        0.1, -0.9, 0.7, -0.6,
    ]
}

fn relation_loss(decoder: &mut Decoder, index: &LayerIndex, emb: &[f32]) -> f32 {
    let mut grad = vec![0.0f32; emb.len()];
    let out = decoder.relation_loss(&DECODER_POSITIVES, index, emb, &mut grad, 0.7);
    assert_eq!(out.scored, DECODER_POSITIVES.len());
    out.loss * DECODER_POSITIVES.len() as f32
}

fn set_decoder_value(decoder: &mut Decoder, param: usize, index: usize, value: f32) {
    let mut params = decoder.parameters_mut();
    params[param].data[index] = value;
}

#[test]
fn relation_classifier_gradients_match_finite_differences() {
    let index = LayerIndex::from_ids([1, 2, 3]);
    let emb = embeddings();
    let mut decoder = Decoder::new(2, EMB_DIM, &mut XorShift128Plus::from_seed(21));
    for p in decoder.parameters_mut() {
        for x in &mut p.data {
            *x *= 10.0;
        }
    }

    let mut grad_emb = vec![0.0f32; emb.len()];
    decoder.relation_loss(&DECODER_POSITIVES, &index, &emb, &mut grad_emb, 0.7);
    let analytic: Vec<Vec<f32>> = decoder.parameters().iter().map(|p| p.grad.clone()).collect();

    let eps = 1e-2;
    for (pi, grads) in analytic.iter().enumerate() {
        for j in probe_indices(grads.len()) {
            let original = decoder.parameters()[pi].data[j];
            set_decoder_value(&mut decoder, pi, j, original + eps);
            let plus = relation_loss(&mut decoder, &index, &emb);
            set_decoder_value(&mut decoder, pi, j, original - eps);
            let minus = relation_loss(&mut decoder, &index, &emb);
            set_decoder_value(&mut decoder, pi, j, original);
            let numeric = (plus - minus) / (2.0 * eps);
            assert!(
                close(grads[j], numeric),
                "param {pi}[{j}]: analytic {} numeric {numeric}",
                grads[j]
            );
        }
    }

    // Every |h - t| component differs by at least 0.3, far from the kink.
    for j in 0..emb.len() {
        let mut plus = emb.clone();
        plus[j] += eps;
        let mut minus = emb.clone();
        minus[j] -= eps;
        let numeric = (relation_loss(&mut decoder, &index, &plus)
            - relation_loss(&mut decoder, &index, &minus))
            / (2.0 * eps);
        assert!(
            close(grad_emb[j], numeric),
            "embedding[{j}]: analytic {} numeric {numeric}",
            grad_emb[j]
        );
    }
}

fn distmult(decoder: &Decoder, rel_emb: &mut Parameter, index: &LayerIndex, emb: &[f32]) -> f32 {
    let mut grad = vec![0.0f32; emb.len()];
    let out = decoder.distmult_loss(
        rel_emb,
        &DECODER_POSITIVES,
        &DECODER_NEGATIVES,
        1,
        index,
        emb,
        &mut grad,
    );
    out.loss * DECODER_POSITIVES.len() as f32
}

#[test]
fn distmult_gradients_match_finite_differences() {
    let index = LayerIndex::from_ids([1, 2, 3]);
    let emb = embeddings();
    let mut rng = XorShift128Plus::from_seed(33);
    let decoder = Decoder::new(2, EMB_DIM, &mut rng);
    let mut rel_emb = Parameter::uniform("rel_emb", 3 * EMB_DIM, 2.0, &mut rng);

    let mut grad_emb = vec![0.0f32; emb.len()];
    decoder.distmult_loss(
        &mut rel_emb,
        &DECODER_POSITIVES,
        &DECODER_NEGATIVES,
        1,
        &index,
        &emb,
        &mut grad_emb,
    );
    let grad_rel = rel_emb.grad.clone();
    assert!(grad_rel[..EMB_DIM].iter().all(|&g| g == 0.0));

    let eps = 1e-2;
    for j in 0..emb.len() {
        let mut plus = emb.clone();
        plus[j] += eps;
        let mut minus = emb.clone();
        minus[j] -= eps;
        let numeric = (distmult(&decoder, &mut rel_emb, &index, &plus)
            - distmult(&decoder, &mut rel_emb, &index, &minus))
            / (2.0 * eps);
        assert!(
            close(grad_emb[j], numeric),
            "embedding[{j}]: analytic {} numeric {numeric}",
            grad_emb[j]
        );
    }

    for j in EMB_DIM..rel_emb.len() {
        let original = rel_emb.data[j];
        rel_emb.data[j] = original + eps;
        let plus = distmult(&decoder, &mut rel_emb, &index, &emb);
        rel_emb.data[j] = original - eps;
        let minus = distmult(&decoder, &mut rel_emb, &index, &emb);
        rel_emb.data[j] = original;
        let numeric = (plus - minus) / (2.0 * eps);
        assert!(
            close(grad_rel[j], numeric),
            "rel_emb[{j}]: analytic {} numeric {numeric}",
            grad_rel[j]
        );
    }
}
