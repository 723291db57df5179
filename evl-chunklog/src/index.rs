use anyhow::Error;

use evl_tools::task::WorkerTaskContext;

use crate::scavenge_point::ScavengePoint;
use crate::stream_handle::StreamHandle;

/// One event as seen by the index, without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventInfo {
    pub event_number: i64,
    pub log_position: i64,
}

/// One raw index table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub stream_hash: u64,
    pub event_number: i64,
    pub log_position: i64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IndexScavengeStats {
    pub entries_kept: u64,
    pub entries_dropped: u64,
}

/// Read access to the secondary index, bounded by a scavenge point.
///
/// All lookups treat the index as if it ended at the scavenge point, so
/// a run never sees events appended after its target. For colliding
/// hashes the implementation disambiguates by reading the stream name
/// from the log.
pub trait IndexReader {
    /// Last event number of the stream at the scavenge point. None when
    /// the stream has no indexed events below it.
    fn last_event_number(
        &self,
        handle: &StreamHandle,
        scavenge_point: &ScavengePoint,
    ) -> Result<Option<i64>, Error>;

    /// Event infos of the stream starting at `from`, ascending, at most
    /// `max_count` of them.
    fn read_event_info_forward(
        &self,
        handle: &StreamHandle,
        from: i64,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<EventInfo>, Error>;

    /// Descending counterpart, used by verification scans.
    fn read_event_info_backward(
        &self,
        handle: &StreamHandle,
        from: i64,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<EventInfo>, Error>;

    /// Stream name of the record at `log_position`, for entries whose
    /// hash collides.
    fn stream_name_at(&self, log_position: i64) -> Result<String, Error>;
}

/// Write access to the secondary index.
pub trait IndexWriter {
    /// Rewrite all index tables keeping only entries the predicate
    /// approves. `threads` bounds the internal merge worker pool.
    fn scavenge(
        &mut self,
        should_keep: &mut dyn FnMut(&IndexEntry) -> Result<bool, Error>,
        threads: usize,
        worker: &dyn WorkerTaskContext,
    ) -> Result<IndexScavengeStats, Error>;

    /// Persist the rewritten tables.
    fn save_to_file(&mut self, worker: &dyn WorkerTaskContext) -> Result<(), Error>;
}
