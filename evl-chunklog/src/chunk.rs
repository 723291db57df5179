use anyhow::{bail, Error};

/// Logical chunk size used when the configuration does not override it.
pub const DEFAULT_CHUNK_SIZE: i64 = 256 * 1024 * 1024;

pub fn verify_chunk_size(size: i64) -> Result<(), Error> {
    if size < 4096 || size > 1024 * 1024 * 1024 {
        bail!("Got unsupported chunk size '{size}'");
    }
    if size & (size - 1) != 0 {
        bail!("chunk size '{size}' is not a power of two");
    }
    Ok(())
}

/// Maps log positions onto logical chunk numbers.
///
/// The transaction file is partitioned into fixed-size logical chunks;
/// a physical chunk file covers one or more consecutive logical chunks
/// (after merging). All scavenge bookkeeping is per logical chunk.
#[derive(Clone, Copy, Debug)]
pub struct ChunkGeometry {
    chunk_size: i64,
}

impl ChunkGeometry {
    pub fn new(chunk_size: i64) -> Result<Self, Error> {
        verify_chunk_size(chunk_size)?;
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> i64 {
        self.chunk_size
    }

    pub fn chunk_number(&self, log_position: i64) -> i64 {
        log_position / self.chunk_size
    }

    pub fn chunk_start_position(&self, chunk_number: i64) -> i64 {
        chunk_number * self.chunk_size
    }

    /// Exclusive end position of a logical chunk.
    pub fn chunk_end_position(&self, chunk_number: i64) -> i64 {
        (chunk_number + 1) * self.chunk_size
    }
}
