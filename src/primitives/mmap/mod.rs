#![allow(unsafe_code)]
//! Read-only typed views over memory-mapped flat arrays.
//!
//! The arrays written by the corpus converter have no header: a file is just
//! `len * size_of::<T>()` little-endian bytes. [`MappedArray`] maps such a
//! file once and hands out `&[T]` borrows tied to the mapping's lifetime, so a
//! view can never outlive the bytes backing it.

use std::fs::File;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use bytemuck::Pod;
use memmap2::Mmap;
use tracing::trace;

use crate::types::{KgError, Result};

/// A flat `[T]` array backed by a read-only file mapping.
pub struct MappedArray<T> {
    map: Option<Mmap>,
    len: usize,
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: Pod> MappedArray<T> {
    /// Maps `path` read-only and checks that it holds a whole number of `T`.
    ///
    /// # Errors
    ///
    /// [`KgError::MissingFile`] if the file does not exist, [`KgError::Format`]
    /// if its size is not a multiple of `size_of::<T>()` or the mapping cannot
    /// be viewed as `[T]`, and [`KgError::Io`] for any other failure.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if cfg!(target_endian = "big") {
            return Err(KgError::format(
                path,
                "flat arrays are little-endian; big-endian hosts are unsupported",
            ));
        }
        let file = File::open(path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => KgError::MissingFile {
                path: path.to_path_buf(),
            },
            _ => KgError::Io(err),
        })?;
        let bytes = file.metadata()?.len() as usize;
        let width = std::mem::size_of::<T>();
        if bytes % width != 0 {
            return Err(KgError::format(
                path,
                format!("size {bytes} is not a multiple of element width {width}"),
            ));
        }
        let map = if bytes == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only and the arrays are immutable
            // for the lifetime of the process; no writer exists in this crate.
            let map = unsafe { Mmap::map(&file)? };
            bytemuck::try_cast_slice::<u8, T>(&map[..])
                .map_err(|err| KgError::format(path, format!("cannot view mapping: {err}")))?;
            Some(map)
        };
        trace!(path = %path.display(), elements = bytes / width, "mapped array");
        Ok(Self {
            map,
            len: bytes / width,
            path: path.to_path_buf(),
            _marker: PhantomData,
        })
    }

    /// Borrowed view of the whole array.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        match &self.map {
            Some(map) => bytemuck::cast_slice(&map[..]),
            None => &[],
        }
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the file was empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path the array was mapped from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> std::fmt::Debug for MappedArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedArray")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}
