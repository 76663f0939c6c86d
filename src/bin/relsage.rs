//! Command-line driver: train, evaluate, answer queries, build reverse graphs.
#![forbid(unsafe_code)]

#[path = "relsage/ui.rs"]
mod ui;

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use relsage::eval::{LinkPredictionReport, Ranking, Scored};
use relsage::model::{AssignReport, CheckpointReport};
use relsage::train::{FitReport, OptimizerKind};
use relsage::{
    build_reverse, evaluate_link_prediction, load_checkpoint, rank_relations, rank_tails,
    CsrGraph, EmbeddingCache, Model, TrainOptions, Trainer, Triple, TripleFile, TrueTails,
};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use ui::{Theme, Ui};

const DEFAULT_CHECKPOINT: &str = "checkpoint.bin";

#[derive(Parser, Debug)]
#[command(
    name = "relsage",
    version,
    about = "Relational GraphSAGE embeddings over CSR graphs",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = ThemeArg::Auto,
        help = "Color theme for text output"
    )]
    theme: ThemeArg,

    #[arg(short, long, global = true, help = "Suppress progress output")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model on a triple file.
    Train(TrainCmd),
    /// Filtered link-prediction metrics for a checkpoint.
    Eval(EvalCmd),
    /// Top-k relations and tails for query triples.
    Infer(InferCmd),
    /// Write the reverse CSR arrays of a graph.
    BuildReverse(BuildReverseCmd),
}

#[derive(Args, Debug)]
struct GraphArgs {
    #[arg(
        short,
        long,
        value_name = "DIR",
        default_value = ".",
        help = "Directory holding the forward graph arrays"
    )]
    data: PathBuf,

    #[arg(long, value_name = "DIR", help = "Directory holding the reverse graph arrays")]
    reverse: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TrainCmd {
    #[command(flatten)]
    graph: GraphArgs,

    #[arg(long, value_name = "FILE", help = "Training triples")]
    train: PathBuf,

    #[arg(
        long,
        value_name = "FILE",
        env = "RELSAGE_CONFIG",
        help = "TOML option file (defaults to the user config file if present)"
    )]
    config: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Continue from this checkpoint")]
    resume: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long, help = "Hidden and relation embedding width")]
    dim: Option<usize>,

    #[arg(long)]
    layers: Option<usize>,

    #[arg(long, value_delimiter = ',', value_name = "N,N", help = "Per-layer fanouts")]
    fanouts: Option<Vec<usize>>,

    #[arg(long, help = "Negative tails per positive")]
    negatives: Option<usize>,

    #[arg(long, help = "Weight of the relation-classification loss")]
    lambda_rel: Option<f32>,

    #[arg(long)]
    lr: Option<f32>,

    #[arg(long, value_enum)]
    optimizer: Option<OptimizerArg>,

    #[arg(long, help = "Do not use in-degree features")]
    no_in_degree: bool,

    #[arg(long, help = "Add deterministic per-node feature noise")]
    noise: bool,

    #[arg(long, help = "Use identity activations")]
    no_relu: bool,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(short, long, value_name = "FILE", help = "Checkpoint destination")]
    checkpoint: Option<PathBuf>,

    #[arg(long, value_name = "EPOCHS", help = "Also save every N epochs")]
    checkpoint_every: Option<usize>,
}

impl TrainCmd {
    fn options(&self) -> Result<TrainOptions, Box<dyn Error>> {
        let mut opts = TrainOptions::load(self.config.as_deref())?;
        if let Some(v) = self.epochs {
            opts.epochs = v;
        }
        if let Some(v) = self.batch_size {
            opts.batch_size = v;
        }
        if let Some(v) = self.dim {
            opts.hidden_dim = v;
        }
        if let Some(v) = self.layers {
            opts.layers = v;
            if self.fanouts.is_none() {
                let fill = opts.fanouts.last().copied().unwrap_or(10);
                opts.fanouts.resize(v, fill);
            }
        }
        if let Some(v) = &self.fanouts {
            opts.fanouts = v.clone();
        }
        if let Some(v) = self.negatives {
            opts.negatives = v;
        }
        if let Some(v) = self.lambda_rel {
            opts.lambda_rel = v;
        }
        if let Some(v) = self.lr {
            opts.lr = v;
        }
        if let Some(v) = self.optimizer {
            opts.optimizer = v.into();
        }
        opts.use_in_degree &= !self.no_in_degree;
        opts.add_noise |= self.noise;
        opts.use_relu &= !self.no_relu;
        if let Some(v) = self.seed {
            opts.seed = v;
        }
        if let Some(v) = &self.checkpoint {
            opts.checkpoint = Some(v.clone());
        }
        if opts.checkpoint.is_none() {
            opts.checkpoint = Some(PathBuf::from(DEFAULT_CHECKPOINT));
        }
        if let Some(v) = self.checkpoint_every {
            opts.checkpoint_every = v;
        }
        opts.validate()?;
        Ok(opts)
    }
}

#[derive(Args, Debug)]
struct EvalCmd {
    #[command(flatten)]
    graph: GraphArgs,

    #[arg(short, long, value_name = "FILE")]
    checkpoint: PathBuf,

    #[arg(long, value_name = "FILE", help = "Triples to rank")]
    eval: PathBuf,

    #[arg(long, value_name = "FILE", help = "Extra known triples for filtering")]
    train: Option<PathBuf>,

    #[arg(long, default_value_t = 99)]
    seed: u64,

    #[arg(long, default_value_t = 1024, help = "Seeds per embedding chunk")]
    batch_nodes: usize,
}

#[derive(Args, Debug)]
struct InferCmd {
    #[command(flatten)]
    graph: GraphArgs,

    #[arg(short, long, value_name = "FILE")]
    checkpoint: PathBuf,

    #[arg(long, value_name = "FILE", help = "(head, relation, tail) triples; rank relations")]
    relation_queries: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "(head, relation, tail) triples; rank tails")]
    tail_queries: Option<PathBuf>,

    #[arg(long, default_value_t = 5)]
    topk: usize,

    #[arg(long, default_value_t = 123)]
    seed: u64,

    #[arg(long, default_value_t = 1024, help = "Seeds per embedding chunk")]
    batch_nodes: usize,
}

#[derive(Args, Debug)]
struct BuildReverseCmd {
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    data: PathBuf,

    #[arg(long, value_name = "DIR", help = "Output directory (defaults to --data)")]
    out: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ThemeArg {
    Auto,
    Plain,
}

impl From<ThemeArg> for Theme {
    fn from(theme: ThemeArg) -> Self {
        match theme {
            ThemeArg::Auto => Theme::Auto,
            ThemeArg::Plain => Theme::Plain,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OptimizerArg {
    Adam,
    Sgd,
}

impl From<OptimizerArg> for OptimizerKind {
    fn from(kind: OptimizerArg) -> Self {
        match kind {
            OptimizerArg::Adam => OptimizerKind::Adam,
            OptimizerArg::Sgd => OptimizerKind::Sgd,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    let ui = Ui::new(cli.theme.into(), cli.quiet);

    match cli.command {
        Command::Train(cmd) => run_train(&cmd, cli.format, &ui),
        Command::Eval(cmd) => run_eval(&cmd, cli.format, &ui),
        Command::Infer(cmd) => run_infer(&cmd, cli.format, &ui),
        Command::BuildReverse(cmd) => run_build_reverse(&cmd, cli.format, &ui),
    }
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// A missing or malformed reverse graph is not fatal; training and scoring
/// continue without in-degree features.
fn load_reverse(args: &GraphArgs) -> Option<CsrGraph> {
    let dir = args.reverse.as_deref()?;
    match CsrGraph::load_reverse(dir) {
        Ok(rev) => Some(rev),
        Err(err) => {
            warn!(dir = %dir.display(), %err, "reverse graph could not be loaded; continuing without it");
            None
        }
    }
}

fn load_model(
    path: &Path,
    reverse: Option<&CsrGraph>,
) -> Result<(Model, AssignReport), Box<dyn Error>> {
    let checkpoint = load_checkpoint(path)?;
    let (model, assigned) = Model::from_checkpoint(&checkpoint)?;
    if model.encoder.feature_config().use_in_degree && reverse.is_none() {
        warn!("model was trained with in-degree features but no reverse graph was given");
    }
    Ok((model, assigned))
}

fn run_train(cmd: &TrainCmd, format: OutputFormat, ui: &Ui) -> Result<(), Box<dyn Error>> {
    let opts = cmd.options()?;
    let graph = CsrGraph::load(&cmd.graph.data)?;
    let reverse = load_reverse(&cmd.graph);
    let triples = TripleFile::open(&cmd.train)?;

    let mut trainer = match &cmd.resume {
        Some(path) => {
            let checkpoint = load_checkpoint(path)?;
            Trainer::resume(&graph, reverse.as_ref(), opts.clone(), &checkpoint)?
        }
        None => Trainer::new(&graph, reverse.as_ref(), opts.clone())?,
    };

    let steps = triples.len().div_ceil(opts.batch_size) * opts.epochs;
    let pb = ui.progress(steps as u64, "train");
    let report = trainer.fit(triples.as_slice(), |step| {
        pb.inc(1);
        pb.set_message(format!("loss {:.4}", step.loss));
    })?;
    pb.finish_and_clear();

    emit(format, &report, || print_fit_text(ui, &report))
}

#[derive(Serialize)]
struct EvalOutput {
    checkpoint: PathBuf,
    assigned: AssignReport,
    queries: usize,
    #[serde(flatten)]
    report: LinkPredictionReport,
}

fn run_eval(cmd: &EvalCmd, format: OutputFormat, ui: &Ui) -> Result<(), Box<dyn Error>> {
    let graph = CsrGraph::load(&cmd.graph.data)?;
    let reverse = load_reverse(&cmd.graph);
    let (model, assigned) = load_model(&cmd.checkpoint, reverse.as_ref())?;
    let eval = TripleFile::open(&cmd.eval)?;
    let train = cmd.train.as_deref().map(TripleFile::open).transpose()?;

    let task = ui.task("embedding nodes");
    let cache =
        EmbeddingCache::build(&model.encoder, &graph, reverse.as_ref(), cmd.batch_nodes, cmd.seed)?;
    let embedded = task.finish();

    let mut sets = vec![eval.as_slice()];
    sets.extend(train.as_ref().map(TripleFile::as_slice));
    let filter = TrueTails::from_sets(sets);
    let report = evaluate_link_prediction(
        &cache,
        &model.encoder.relation_embeddings().data,
        eval.as_slice(),
        &filter,
    );

    let output = EvalOutput {
        checkpoint: cmd.checkpoint.clone(),
        assigned,
        queries: eval.len(),
        report,
    };
    emit(format, &output, || {
        ui.line(&embedded);
        print_eval_text(ui, &output);
    })
}

#[derive(Serialize)]
struct QueryResult {
    head: u32,
    relation: u32,
    tail: u32,
    top: Vec<Scored>,
    rank: Option<u64>,
}

impl QueryResult {
    fn new(q: &Triple, ranking: Ranking) -> Self {
        Self {
            head: q.head,
            relation: q.relation,
            tail: q.tail,
            top: ranking.top,
            rank: ranking.rank,
        }
    }
}

#[derive(Serialize, Default)]
struct InferOutput {
    relations: Vec<QueryResult>,
    tails: Vec<QueryResult>,
    skipped: usize,
}

fn run_infer(cmd: &InferCmd, format: OutputFormat, ui: &Ui) -> Result<(), Box<dyn Error>> {
    if cmd.relation_queries.is_none() && cmd.tail_queries.is_none() {
        return Err("infer needs --relation-queries and/or --tail-queries".into());
    }
    let graph = CsrGraph::load(&cmd.graph.data)?;
    let reverse = load_reverse(&cmd.graph);
    let (model, _) = load_model(&cmd.checkpoint, reverse.as_ref())?;

    let task = ui.task("embedding nodes");
    let cache =
        EmbeddingCache::build(&model.encoder, &graph, reverse.as_ref(), cmd.batch_nodes, cmd.seed)?;
    task.finish();

    let mut output = InferOutput::default();
    if let Some(path) = &cmd.relation_queries {
        let queries = TripleFile::open(path)?;
        for q in queries.as_slice() {
            match rank_relations(&model.decoder, &cache, q, cmd.topk) {
                Some(ranking) => output.relations.push(QueryResult::new(q, ranking)),
                None => output.skipped += 1,
            }
        }
    }
    if let Some(path) = &cmd.tail_queries {
        let queries = TripleFile::open(path)?;
        let rel_emb = &model.encoder.relation_embeddings().data;
        for q in queries.as_slice() {
            match rank_tails(&cache, rel_emb, q, cmd.topk) {
                Some(ranking) => output.tails.push(QueryResult::new(q, ranking)),
                None => output.skipped += 1,
            }
        }
    }
    emit(format, &output, || print_infer_text(ui, &output))
}

#[derive(Serialize)]
struct ReverseOutput {
    out: PathBuf,
    nodes: u32,
    edges: u32,
}

fn run_build_reverse(
    cmd: &BuildReverseCmd,
    format: OutputFormat,
    ui: &Ui,
) -> Result<(), Box<dyn Error>> {
    let graph = CsrGraph::load(&cmd.data)?;
    let out = cmd.out.clone().unwrap_or_else(|| cmd.data.clone());
    build_reverse(&graph).write(&out)?;
    let output = ReverseOutput {
        out,
        nodes: graph.num_nodes(),
        edges: graph.num_edges(),
    };
    emit(format, &output, || {
        ui.success(&format!(
            "Reverse graph written to {} ({} nodes, {} edges)",
            output.out.display(),
            output.nodes,
            output.edges
        ))
    })
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_fit_text(ui: &Ui, report: &FitReport) {
    for epoch in &report.epochs {
        ui.line(&format!(
            "Epoch {} loss={:.6} (link={:.6} rel={:.6}) batches={} in {:.0} ms",
            epoch.epoch,
            epoch.loss,
            epoch.link_loss,
            epoch.rel_loss,
            epoch.batches,
            epoch.duration_ms
        ));
        if epoch.skipped_positives > 0 || epoch.rel_skipped_positives > 0 {
            ui.line(&format!(
                "  skipped positives: link={} rel={}",
                epoch.skipped_positives, epoch.rel_skipped_positives
            ));
        }
    }
    if let Some(saved) = &report.checkpoint {
        print_checkpoint_text(ui, saved);
    }
}

fn print_checkpoint_text(ui: &Ui, report: &CheckpointReport) {
    ui.success(&format!(
        "Checkpoint saved to {} ({} bytes, step {}, crc32 {:08x})",
        report.path.display(),
        report.bytes,
        report.step,
        report.crc32
    ));
}

fn print_eval_text(ui: &Ui, output: &EvalOutput) {
    let m = &output.report.metrics;
    ui.section(
        "Link prediction (filtered)",
        [
            ("queries", output.queries.to_string()),
            ("scored", m.count.to_string()),
            ("skipped", output.report.skipped.to_string()),
            ("MRR", format!("{:.4}", m.mrr)),
            ("Hits@1", format!("{:.4}", m.hits1)),
            ("Hits@3", format!("{:.4}", m.hits3)),
            ("Hits@10", format!("{:.4}", m.hits10)),
            ("Hits@100", format!("{:.4}", m.hits100)),
        ],
    );
    if output.assigned.skipped_shape > 0 {
        ui.line(&format!(
            "warning: {} checkpoint buffers did not match the model shape",
            output.assigned.skipped_shape
        ));
    }
}

fn format_top(top: &[Scored]) -> String {
    top.iter()
        .map(|s| format!("{}:{:.4}", s.id, s.score))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_infer_text(ui: &Ui, output: &InferOutput) {
    for q in &output.relations {
        let mut line = format!("Query ({},{}) top relations: {}", q.head, q.tail, format_top(&q.top));
        if let Some(rank) = q.rank {
            line.push_str(&format!(" true_r={} rank={rank}", q.relation));
        }
        ui.line(&line);
    }
    for q in &output.tails {
        let mut line = format!(
            "Query ({},{},?) top tails: {}",
            q.head,
            q.relation,
            format_top(&q.top)
        );
        if let Some(rank) = q.rank {
            line.push_str(&format!(" true_t={} rank={rank}", q.tail));
        }
        ui.line(&line);
    }
    if output.skipped > 0 {
        ui.line(&format!("{} queries skipped (zero or unknown ids)", output.skipped));
    }
}
