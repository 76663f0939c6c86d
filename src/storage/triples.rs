//! Fixed 12-byte `(head, relation, tail)` records used for training,
//! evaluation and query input.

use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::primitives::io::write_array;
use crate::primitives::MappedArray;
use crate::types::Result;

/// One triple record exactly as stored on disk.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Triple {
    /// Source node id.
    pub head: u32,
    /// Relation id.
    pub relation: u32,
    /// Destination node id.
    pub tail: u32,
}

impl Triple {
    /// Convenience constructor.
    pub const fn new(head: u32, relation: u32, tail: u32) -> Self {
        Self {
            head,
            relation,
            tail,
        }
    }

    /// True if any id is the `0` sentinel.
    pub fn has_sentinel(&self) -> bool {
        self.head == 0 || self.relation == 0 || self.tail == 0
    }
}

/// Memory-mapped triple file.
#[derive(Debug)]
pub struct TripleFile {
    records: MappedArray<Triple>,
}

impl TripleFile {
    /// Maps `path`; its size must be a multiple of 12 bytes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            records: MappedArray::open(path)?,
        })
    }

    /// All records.
    pub fn as_slice(&self) -> &[Triple] {
        self.records.as_slice()
    }

    /// Record count.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True for an empty file.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Path the file was mapped from.
    pub fn path(&self) -> &Path {
        self.records.path()
    }
}

/// Writes `triples` as a headerless record array.
pub fn write_triples(path: impl AsRef<Path>, triples: &[Triple]) -> Result<()> {
    write_array(path, triples)
}
