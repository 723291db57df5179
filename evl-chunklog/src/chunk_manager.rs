use anyhow::Error;

use evl_tools::task::WorkerTaskContext;

use crate::record::{PrepareRecord, RecordKind, SystemRecord};

/// Sequential reader over one physical chunk file.
///
/// Records are pulled through [`next_record`](Self::next_record) into two
/// caller owned buffers, one for prepares and one for system records; the
/// returned [`RecordKind`] says which buffer was filled. A reader is
/// positioned at the first record when handed out.
pub trait ChunkReader {
    /// File name, used for error reporting.
    fn name(&self) -> &str;

    /// First logical chunk number covered by this physical chunk.
    fn chunk_start_number(&self) -> i64;

    /// Last logical chunk number covered by this physical chunk.
    fn chunk_end_number(&self) -> i64;

    fn chunk_start_position(&self) -> i64;

    /// Exclusive end position of the covered range.
    fn chunk_end_position(&self) -> i64;

    fn file_size(&self) -> u64;

    /// Completed chunks are read-only; the currently written head chunk
    /// is not and is never rewritten.
    fn is_read_only(&self) -> bool;

    fn next_record(
        &mut self,
        prepare: &mut PrepareRecord,
        system: &mut SystemRecord,
    ) -> Result<Option<RecordKind>, Error>;
}

/// Writer for the replacement of one physical chunk.
///
/// The implementation writes to a temporary file; [`complete`]
/// atomically swaps it in for the source chunk. Callers must finish a
/// writer with either [`complete`] or [`abort`].
///
/// [`complete`]: Self::complete
/// [`abort`]: Self::abort
pub trait ChunkWriter {
    fn write_prepare(&mut self, record: &PrepareRecord) -> Result<(), Error>;

    fn write_system(&mut self, record: &SystemRecord) -> Result<(), Error>;

    /// Commit the rewritten chunk. Returns the new file name and size.
    fn complete(&mut self) -> Result<(String, u64), Error>;

    /// Abandon the rewrite. With `delete_immediately` the temporary file
    /// is removed right away, otherwise it is left behind for inspection
    /// and cleaned up by the next successful rewrite of the same chunk.
    fn abort(&mut self, delete_immediately: bool);
}

/// Access to the chunk files of the transaction file.
pub trait ChunkManager {
    fn chunk_size(&self) -> i64;

    /// Number of logical chunks the log currently spans.
    fn chunk_count(&self) -> i64;

    /// Reader for the physical chunk containing `log_position`.
    fn get_chunk_reader_for(&self, log_position: i64) -> Result<Box<dyn ChunkReader>, Error>;

    fn create_chunk_writer(&self, source: &dyn ChunkReader) -> Result<Box<dyn ChunkWriter>, Error>;

    /// Merge adjacent small chunks after execution. May be a no-op.
    fn merge_chunks(&self, worker: &dyn WorkerTaskContext) -> Result<(), Error>;
}
