pub mod extents;
pub mod hyperslab;

pub use extents::{Extent, VersionStore};
pub use hyperslab::Hyperslab;

use crate::error::{Result, TideError};

/// One `(offset, len)` fragment of a blob I/O descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobFrag {
    pub offset: u64,
    pub len: u64,
}

/// Offset-addressed I/O descriptor for blob objects. The target of a write
/// or the source of a read.
#[derive(Debug, Clone, Default)]
pub struct BlobIoDesc {
    pub frags: Vec<BlobFrag>,
}

impl BlobIoDesc {
    pub fn single(offset: u64, len: u64) -> Self {
        Self {
            frags: vec![BlobFrag { offset, len }],
        }
    }

    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.frags.iter().map(|f| (f.offset, f.len)).collect()
    }

    pub fn validate(&self) -> Result<()> {
        for frag in &self.frags {
            if frag.offset.checked_add(frag.len).is_none() {
                return Err(TideError::InvalidArgument(format!(
                    "blob fragment overflows: offset={} len={}",
                    frag.offset, frag.len
                )));
            }
        }
        Ok(())
    }
}
