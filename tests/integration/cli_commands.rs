#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use relsage::storage::{write_triples, CsrBuilder, Triple};
use serde_json::Value;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    data: PathBuf,
    train: PathBuf,
    queries: PathBuf,
    checkpoint: PathBuf,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let data = dir.path().join("graph");
    let mut b = CsrBuilder::new(6, 2);
    let mut triples = Vec::new();
    for v in 1..=6u32 {
        let next = v % 6 + 1;
        let skip = (v + 1) % 6 + 1;
        b.add_edge(v, 1, next).add_edge(v, 2, skip);
        triples.push(Triple::new(v, 1, next));
        triples.push(Triple::new(v, 2, skip));
    }
    b.write(&data).expect("write graph");

    let train = dir.path().join("train.bin");
    write_triples(&train, &triples).expect("write train");
    let queries = dir.path().join("queries.bin");
    write_triples(
        &queries,
        &[Triple::new(1, 1, 2), Triple::new(3, 2, 5), Triple::new(0, 1, 2)],
    )
    .expect("write queries");
    let checkpoint = dir.path().join("model.bin");
    Fixture {
        _dir: dir,
        data,
        train,
        queries,
        checkpoint,
    }
}

fn json_stdout(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("valid json")
}

fn build_reverse(data: &Path) -> Value {
    let output = cargo_bin_cmd!("relsage")
        .args(["--format", "json", "build-reverse", "--data"])
        .arg(data)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    json_stdout(&output)
}

fn train(f: &Fixture) -> Value {
    let output = cargo_bin_cmd!("relsage")
        .env_remove("RELSAGE_CONFIG")
        .args(["--format", "json", "-q", "train", "--data"])
        .arg(&f.data)
        .arg("--reverse")
        .arg(&f.data)
        .arg("--train")
        .arg(&f.train)
        .arg("--checkpoint")
        .arg(&f.checkpoint)
        .args([
            "--epochs", "2", "--dim", "8", "--layers", "1", "--fanouts", "2", "--batch-size", "4",
            "--negatives", "2", "--seed", "3",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    json_stdout(&output)
}

#[test]
fn build_reverse_reports_counts() {
    let f = fixture();
    let json = build_reverse(&f.data);
    assert_eq!(json["nodes"], 6);
    assert_eq!(json["edges"], 12);
    assert!(f.data.join("offsets_rev.bin").exists());
    assert!(f.data.join("csr_rev.bin").exists());
    assert!(f.data.join("rels_rev.bin").exists());
}

#[test]
fn train_eval_infer_pipeline() {
    let f = fixture();
    build_reverse(&f.data);

    let fit = train(&f);
    let epochs = fit["epochs"].as_array().expect("epochs");
    assert_eq!(epochs.len(), 2);
    assert_eq!(epochs[0]["batches"], 3);
    assert!(epochs[1]["loss"].as_f64().expect("loss").is_finite());
    assert_eq!(fit["checkpoint"]["step"], 6);
    assert!(f.checkpoint.exists());

    let output = cargo_bin_cmd!("relsage")
        .args(["--format", "json", "-q", "eval", "--data"])
        .arg(&f.data)
        .arg("--reverse")
        .arg(&f.data)
        .arg("--checkpoint")
        .arg(&f.checkpoint)
        .arg("--eval")
        .arg(&f.queries)
        .arg("--train")
        .arg(&f.train)
        .args(["--batch-nodes", "4"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let eval = json_stdout(&output);
    assert_eq!(eval["queries"], 3);
    assert_eq!(eval["skipped"], 1);
    assert_eq!(eval["metrics"]["count"], 2);
    let mrr = eval["metrics"]["mrr"].as_f64().expect("mrr");
    assert!(mrr > 0.0 && mrr <= 1.0);
    assert_eq!(eval["assigned"]["skipped_shape"], 0);

    let output = cargo_bin_cmd!("relsage")
        .args(["--format", "json", "-q", "infer", "--data"])
        .arg(&f.data)
        .arg("--reverse")
        .arg(&f.data)
        .arg("--checkpoint")
        .arg(&f.checkpoint)
        .arg("--relation-queries")
        .arg(&f.queries)
        .arg("--tail-queries")
        .arg(&f.queries)
        .args(["--topk", "3"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let infer = json_stdout(&output);
    let relations = infer["relations"].as_array().expect("relations");
    let tails = infer["tails"].as_array().expect("tails");
    assert_eq!(relations.len(), 2);
    assert_eq!(tails.len(), 2);
    assert_eq!(infer["skipped"], 2);
    assert_eq!(relations[0]["top"].as_array().expect("top").len(), 2);
    assert_eq!(tails[0]["top"].as_array().expect("top").len(), 3);
    assert!(tails[0]["rank"].as_u64().is_some());
}

#[test]
fn text_output_prints_epochs() {
    let f = fixture();
    let output = cargo_bin_cmd!("relsage")
        .env_remove("RELSAGE_CONFIG")
        .args(["--theme", "plain", "-q", "train", "--data"])
        .arg(&f.data)
        .arg("--train")
        .arg(&f.train)
        .arg("--checkpoint")
        .arg(&f.checkpoint)
        .args(["--epochs", "1", "--dim", "4", "--layers", "1", "--fanouts", "1"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("Epoch 1 loss="), "{text}");
    assert!(text.contains("Checkpoint saved to"), "{text}");
}

#[test]
fn missing_graph_fails_with_message() {
    let f = fixture();
    let output = cargo_bin_cmd!("relsage")
        .env_remove("RELSAGE_CONFIG")
        .args(["train", "--data"])
        .arg(f.data.join("absent"))
        .arg("--train")
        .arg(&f.train)
        .arg("--checkpoint")
        .arg(&f.checkpoint)
        .assert()
        .failure()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("error: missing file"), "{stderr}");
    assert!(!f.checkpoint.exists());
}

#[test]
fn infer_without_queries_is_rejected() {
    let f = fixture();
    cargo_bin_cmd!("relsage")
        .args(["infer", "--data"])
        .arg(&f.data)
        .arg("--checkpoint")
        .arg(&f.checkpoint)
        .assert()
        .failure()
        .code(1);
}
