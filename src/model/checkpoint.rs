//! Single-file binary checkpoint of configuration, parameters and Adam
//! moments.
//!
//! Layout, all little-endian:
//!
//! ```text
//! u32 magic "KGC1" | u32 version
//! u64 hidden | u32 layers | u64 fanout_len | u64 fanouts[fanout_len] | u8 use_relu
//! u8 use_in_degree | u8 add_noise | u64 num_relations | u64 feature_dim
//! u32 param_count | param_count x (u64 len | f32[len])
//! u8 use_adam | u64 step | if use_adam: param_count x m, then param_count x v
//! ```
//!
//! Parameters are encoder then decoder in their fixed order; loading is
//! positional.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use super::decoder::Decoder;
use super::encoder::{Encoder, EncoderConfig};
use super::features::FeatureConfig;
use super::optim::Optimizer;
use super::params::Parameter;
use crate::primitives::io::ensure_parent_dir;
use crate::types::{ChecksumWriter, KgError, Result};

/// "KGC1".
pub const CHECKPOINT_MAGIC: u32 = 0x4b47_4331;
/// Current format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Everything in a checkpoint besides the float buffers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckpointMeta {
    /// Encoder shape.
    pub encoder: EncoderConfig,
    /// Feature flags as normalized by the encoder.
    pub features: FeatureConfig,
    /// `R`.
    pub num_relations: usize,
    /// Raw feature width.
    pub feature_dim: usize,
    /// Whether moment buffers follow.
    pub use_adam: bool,
    /// Optimizer step counter.
    pub step: u64,
}

/// Decoded checkpoint contents.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    /// Header fields.
    pub meta: CheckpointMeta,
    /// Parameter buffers, encoder then decoder.
    pub params: Vec<Vec<f32>>,
    /// Adam first moments; empty without Adam.
    pub m: Vec<Vec<f32>>,
    /// Adam second moments; empty without Adam.
    pub v: Vec<Vec<f32>>,
}

/// Summary of a completed save.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    /// Destination file.
    pub path: PathBuf,
    /// File size in bytes.
    pub bytes: u64,
    /// Number of parameter buffers written.
    pub params: usize,
    /// Optimizer step stored.
    pub step: u64,
    /// Whether Adam moments were written.
    pub use_adam: bool,
    /// CRC32 of the whole file.
    pub crc32: u32,
    /// Wall time of the save in milliseconds.
    pub duration_ms: f64,
}

/// Outcome of positional parameter reassignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssignReport {
    /// Buffers copied into the model.
    pub assigned: usize,
    /// Buffers left untouched because their length differed.
    pub skipped_shape: usize,
}

/// Writes `encoder`, `decoder` and, when it keeps Adam moments, `optimizer`
/// to `path`. The file is written beside the target and renamed into place.
pub fn save_checkpoint(
    path: impl AsRef<Path>,
    encoder: &Encoder,
    decoder: &Decoder,
    optimizer: Option<&Optimizer>,
) -> Result<CheckpointReport> {
    let path = path.as_ref();
    let start = Instant::now();
    ensure_parent_dir(path)?;
    let tmp = path.with_extension("tmp");

    let mut w = ChecksumWriter::new(BufWriter::new(File::create(&tmp)?));
    let cfg = encoder.config();
    let features = encoder.feature_config();
    w.write_all(&CHECKPOINT_MAGIC.to_le_bytes())?;
    w.write_all(&CHECKPOINT_VERSION.to_le_bytes())?;
    w.write_all(&(cfg.hidden_dim as u64).to_le_bytes())?;
    w.write_all(&(cfg.layers as u32).to_le_bytes())?;
    w.write_all(&(cfg.fanouts.len() as u64).to_le_bytes())?;
    for &f in &cfg.fanouts {
        w.write_all(&(f as u64).to_le_bytes())?;
    }
    w.write_all(&[u8::from(cfg.use_relu)])?;
    w.write_all(&[u8::from(features.use_in_degree), u8::from(features.add_noise)])?;
    w.write_all(&(encoder.num_relations() as u64).to_le_bytes())?;
    w.write_all(&(encoder.feature_dim() as u64).to_le_bytes())?;

    let params: Vec<&Parameter> = encoder
        .parameters()
        .into_iter()
        .chain(decoder.parameters())
        .collect();
    w.write_all(&(params.len() as u32).to_le_bytes())?;
    for p in &params {
        write_floats(&mut w, &p.data)?;
    }

    let adam = optimizer.filter(|o| o.uses_adam() && !o.m().is_empty());
    let step = optimizer.map_or(0, Optimizer::step_count);
    w.write_all(&[u8::from(adam.is_some())])?;
    w.write_all(&step.to_le_bytes())?;
    if let Some(opt) = adam {
        for m in opt.m() {
            write_floats(&mut w, m)?;
        }
        for v in opt.v() {
            write_floats(&mut w, v)?;
        }
    }
    w.flush()?;
    let crc32 = w.crc32();
    let bytes = w.bytes_written();
    let file = w.into_inner().into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;

    let report = CheckpointReport {
        path: path.to_path_buf(),
        bytes,
        params: params.len(),
        step,
        use_adam: adam.is_some(),
        crc32,
        duration_ms: start.elapsed().as_secs_f64() * 1_000.0,
    };
    info!(
        path = %path.display(),
        bytes,
        params = report.params,
        step,
        crc32 = %format!("{crc32:08x}"),
        "checkpoint saved"
    );
    Ok(report)
}

fn write_floats<W: Write>(w: &mut W, values: &[f32]) -> Result<()> {
    w.write_all(&(values.len() as u64).to_le_bytes())?;
    for x in values {
        w.write_all(&x.to_le_bytes())?;
    }
    Ok(())
}

/// Reads a checkpoint written by [`save_checkpoint`].
///
/// # Errors
///
/// [`KgError::MissingFile`] if `path` does not exist, [`KgError::BadMagic`] or
/// [`KgError::UnsupportedVersion`] for a foreign header, and
/// [`KgError::Truncated`] naming the first field that could not be read in
/// full. Vector lengths are checked against the bytes left in the file before
/// any buffer is allocated.
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => KgError::MissingFile {
            path: path.to_path_buf(),
        },
        _ => KgError::Io(err),
    })?;
    let size = file.metadata()?.len();
    let mut r = FieldReader {
        inner: BufReader::new(file),
        remaining: size,
        path,
    };

    let magic = r.u32("magic")?;
    if magic != CHECKPOINT_MAGIC {
        return Err(KgError::BadMagic { found: magic });
    }
    let version = r.u32("version")?;
    if version != CHECKPOINT_VERSION {
        return Err(KgError::UnsupportedVersion(version));
    }

    let hidden_dim = r.usize("hidden_dim")?;
    let layers = r.u32("layers")? as usize;
    let fanout_len = r.u64("fanout_len")?;
    r.ensure(fanout_len, 8, "fanouts")?;
    let mut fanouts = Vec::with_capacity(fanout_len as usize);
    for _ in 0..fanout_len {
        fanouts.push(r.usize("fanouts")?);
    }
    let use_relu = r.u8("use_relu")? != 0;
    let use_in_degree = r.u8("use_in_degree")? != 0;
    let add_noise = r.u8("add_noise")? != 0;
    let num_relations = r.usize("num_relations")?;
    let feature_dim = r.usize("feature_dim")?;

    let param_count = r.u32("param_count")? as usize;
    let mut params = Vec::with_capacity(param_count.min(1024));
    for _ in 0..param_count {
        params.push(r.floats("params")?);
    }
    let use_adam = r.u8("use_adam")? != 0;
    let step = r.u64("step")?;
    let (mut m, mut v) = (Vec::new(), Vec::new());
    if use_adam {
        for _ in 0..param_count {
            m.push(r.floats("adam_m")?);
        }
        for _ in 0..param_count {
            v.push(r.floats("adam_v")?);
        }
    }
    if r.remaining > 0 {
        warn!(path = %path.display(), trailing = r.remaining, "checkpoint has trailing bytes");
    }

    let meta = CheckpointMeta {
        encoder: EncoderConfig {
            hidden_dim,
            layers,
            fanouts,
            use_relu,
        },
        features: FeatureConfig {
            use_in_degree,
            add_noise,
        },
        num_relations,
        feature_dim,
        use_adam,
        step,
    };
    info!(
        path = %path.display(),
        params = params.len(),
        step,
        use_adam,
        "checkpoint loaded"
    );
    Ok(Checkpoint { meta, params, m, v })
}

struct FieldReader<'a, R> {
    inner: R,
    remaining: u64,
    path: &'a Path,
}

impl<R: Read> FieldReader<'_, R> {
    fn fill(&mut self, buf: &mut [u8], field: &'static str) -> Result<()> {
        if (buf.len() as u64) > self.remaining {
            return Err(KgError::Truncated { field });
        }
        self.inner.read_exact(buf).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => KgError::Truncated { field },
            _ => KgError::Io(err),
        })?;
        self.remaining -= buf.len() as u64;
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b, field)?;
        Ok(b[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b, field)?;
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64> {
        let mut b = [0u8; 8];
        self.fill(&mut b, field)?;
        Ok(u64::from_le_bytes(b))
    }

    fn usize(&mut self, field: &'static str) -> Result<usize> {
        let v = self.u64(field)?;
        usize::try_from(v)
            .map_err(|_| KgError::format(self.path, format!("{field} value {v} exceeds usize")))
    }

    fn ensure(&self, count: u64, width: u64, field: &'static str) -> Result<()> {
        match count.checked_mul(width) {
            Some(bytes) if bytes <= self.remaining => Ok(()),
            _ => Err(KgError::Truncated { field }),
        }
    }

    fn floats(&mut self, field: &'static str) -> Result<Vec<f32>> {
        let len = self.u64(field)?;
        self.ensure(len, 4, field)?;
        let mut raw = vec![0u8; len as usize * 4];
        self.fill(&mut raw, field)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Copies `data` into `params` position by position.
///
/// # Errors
///
/// [`KgError::StateMismatch`] when the buffer counts differ; nothing is
/// assigned in that case. Individual length mismatches are skipped, logged
/// and counted.
pub fn assign_parameters(
    data: &[Vec<f32>],
    params: &mut [&mut Parameter],
) -> Result<AssignReport> {
    if data.len() != params.len() {
        return Err(KgError::StateMismatch {
            expected: params.len(),
            found: data.len(),
        });
    }
    let mut report = AssignReport::default();
    for (values, p) in data.iter().zip(params.iter_mut()) {
        if p.assign(values) {
            report.assigned += 1;
        } else {
            warn!(
                param = p.name(),
                expected = p.len(),
                found = values.len(),
                "checkpoint buffer shape mismatch; keeping initialized values"
            );
            report.skipped_shape += 1;
        }
    }
    Ok(report)
}
