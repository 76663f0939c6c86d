#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use bytemuck::Pod;

use crate::types::Result;

/// Writes `data` as a headerless flat array, truncating any existing file.
pub fn write_array<T: Pod>(path: impl AsRef<Path>, data: &[T]) -> Result<()> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(bytemuck::cast_slice(data))?;
    out.flush()?;
    Ok(())
}

/// Creates the parent directory of `path` if it is missing.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
