//! Scavenge stage 4: rewrite the secondary index.
//!
//! The index writer streams every `(hash, event number, position)` entry
//! through the predicate built here. Unlike chunks there is no weight
//! gate, the index is always brought in line with the discard points of
//! the round.

use anyhow::Error;

use evl_api_types::{ScavengeStatus, ScavengeTuning};
use evl_chunklog::{ChunkGeometry, IndexEntry, IndexReader, IndexWriter, ScavengePoint};
use evl_tools::task::WorkerTaskContext;
use evl_tools::task_log;

use super::state::{IndexExecInfo, StateForIndexExecutor};

#[allow(clippy::too_many_arguments)]
pub fn execute_index(
    state: &dyn StateForIndexExecutor,
    index_reader: &dyn IndexReader,
    index_writer: &mut dyn IndexWriter,
    geometry: &ChunkGeometry,
    target: &ScavengePoint,
    tuning: &ScavengeTuning,
    threads: usize,
    status: &mut ScavengeStatus,
    worker: &dyn WorkerTaskContext,
) -> Result<(), Error> {
    let unsafe_mode = tuning.unsafe_ignore_hard_deletes();
    let skew = tuning.skew_tolerance();

    let stats = index_writer.scavenge(
        &mut |entry| {
            should_keep_entry(state, index_reader, geometry, target, unsafe_mode, skew, entry)
        },
        threads,
        worker,
    )?;
    index_writer.save_to_file(worker)?;

    status.index_entries_dropped += stats.entries_dropped;
    task_log!(
        worker,
        "index executed: {} entries kept, {} dropped",
        stats.entries_kept,
        stats.entries_dropped,
    );

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn should_keep_entry(
    state: &dyn StateForIndexExecutor,
    index_reader: &dyn IndexReader,
    geometry: &ChunkGeometry,
    target: &ScavengePoint,
    unsafe_mode: bool,
    skew: i64,
    entry: &IndexEntry,
) -> Result<bool, Error> {
    if entry.log_position >= target.position {
        return Ok(true);
    }

    // colliding hashes need the stream name from the log to pick the
    // right state entry
    let info = if state.is_colliding_hash(entry.stream_hash) {
        let name = index_reader.stream_name_at(entry.log_position)?;
        state.index_exec_info_by_name(&name)
    } else {
        state.index_exec_info_by_hash(entry.stream_hash)
    };
    let Some(info) = info else {
        return Ok(true);
    };

    let keep = match info {
        IndexExecInfo::Metastream(meta) => {
            !meta.is_tombstoned && !meta.discard_point.should_discard(entry.event_number)
        }
        IndexExecInfo::Original(original) => {
            if original.is_tombstoned && unsafe_mode {
                false
            } else if original.discard_point.should_discard(entry.event_number) {
                false
            } else if let Some(max_age) = original.max_age {
                // age based entries drop only when the whole chunk is
                // provably old, the same rule the calculator applied
                let in_maybe = original.maybe_discard_point.should_discard(entry.event_number);
                let chunk_is_old = state
                    .time_range(geometry.chunk_number(entry.log_position))
                    .map(|range| range.max < target.cutoff(max_age) - skew)
                    .unwrap_or(false);
                !(in_maybe && chunk_is_old)
            } else {
                true
            }
        }
    };

    Ok(keep)
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::scavenge::discard_point::DiscardPoint;
    use crate::scavenge::state::{ChunkTimeRange, MetastreamExecInfo, OriginalExecInfo};

    struct FixedState {
        colliding: bool,
        by_hash: Option<IndexExecInfo>,
        by_name: Option<IndexExecInfo>,
        range: Option<ChunkTimeRange>,
    }

    impl StateForIndexExecutor for FixedState {
        fn is_colliding_hash(&self, _hash: u64) -> bool {
            self.colliding
        }

        fn index_exec_info_by_hash(&self, _hash: u64) -> Option<IndexExecInfo> {
            self.by_hash.clone()
        }

        fn index_exec_info_by_name(&self, _stream_id: &str) -> Option<IndexExecInfo> {
            self.by_name.clone()
        }

        fn time_range(&self, _logical_chunk: i64) -> Option<ChunkTimeRange> {
            self.range
        }
    }

    struct NoIndex;

    impl IndexReader for NoIndex {
        fn last_event_number(
            &self,
            _handle: &evl_chunklog::StreamHandle,
            _scavenge_point: &ScavengePoint,
        ) -> Result<Option<i64>, Error> {
            unreachable!()
        }

        fn read_event_info_forward(
            &self,
            _handle: &evl_chunklog::StreamHandle,
            _from: i64,
            _max_count: usize,
            _scavenge_point: &ScavengePoint,
        ) -> Result<Vec<evl_chunklog::EventInfo>, Error> {
            unreachable!()
        }

        fn read_event_info_backward(
            &self,
            _handle: &evl_chunklog::StreamHandle,
            _from: i64,
            _max_count: usize,
            _scavenge_point: &ScavengePoint,
        ) -> Result<Vec<evl_chunklog::EventInfo>, Error> {
            unreachable!()
        }

        fn stream_name_at(&self, _log_position: i64) -> Result<String, Error> {
            Ok("ab-1".to_string())
        }
    }

    fn geometry() -> ChunkGeometry {
        ChunkGeometry::new(4096).unwrap()
    }

    fn target() -> ScavengePoint {
        ScavengePoint {
            position: 10_000,
            event_number: 0,
            effective_now: 1_000_000,
            threshold: 0,
        }
    }

    fn entry(event_number: i64, log_position: i64) -> IndexEntry {
        IndexEntry {
            stream_hash: 7,
            event_number,
            log_position,
        }
    }

    #[test]
    fn test_entries_below_discard_point_drop() {
        let state = FixedState {
            colliding: false,
            by_hash: Some(IndexExecInfo::Original(OriginalExecInfo {
                is_tombstoned: false,
                discard_point: DiscardPoint::discard_before(5),
                maybe_discard_point: DiscardPoint::discard_before(5),
                max_age: None,
            })),
            by_name: None,
            range: None,
        };
        assert!(!should_keep_entry(&state, &NoIndex, &geometry(), &target(), false, 60, &entry(4, 100)).unwrap());
        assert!(should_keep_entry(&state, &NoIndex, &geometry(), &target(), false, 60, &entry(5, 100)).unwrap());
        // past the scavenge point everything stays
        assert!(should_keep_entry(&state, &NoIndex, &geometry(), &target(), false, 60, &entry(0, 20_000)).unwrap());
    }

    #[test]
    fn test_colliding_hash_resolves_by_name() {
        let state = FixedState {
            colliding: true,
            by_hash: None,
            by_name: Some(IndexExecInfo::Original(OriginalExecInfo {
                is_tombstoned: false,
                discard_point: DiscardPoint::discard_before(3),
                maybe_discard_point: DiscardPoint::discard_before(3),
                max_age: None,
            })),
            range: None,
        };
        assert!(!should_keep_entry(&state, &NoIndex, &geometry(), &target(), false, 60, &entry(2, 100)).unwrap());
    }

    #[test]
    fn test_maybe_entries_need_old_chunk() {
        let info = IndexExecInfo::Original(OriginalExecInfo {
            is_tombstoned: false,
            discard_point: DiscardPoint::keep_all(),
            maybe_discard_point: DiscardPoint::discard_before(10),
            max_age: Some(100_000),
        });

        // chunk provably old: cutoff 900_000, skew 60
        let state = FixedState {
            colliding: false,
            by_hash: Some(info.clone()),
            by_name: None,
            range: Some(ChunkTimeRange {
                min: 1000,
                max: 899_000,
            }),
        };
        assert!(!should_keep_entry(&state, &NoIndex, &geometry(), &target(), false, 60, &entry(3, 100)).unwrap());

        // chunk range reaches past the cutoff margin: keep
        let state = FixedState {
            colliding: false,
            by_hash: Some(info),
            by_name: None,
            range: Some(ChunkTimeRange {
                min: 1000,
                max: 899_941,
            }),
        };
        assert!(should_keep_entry(&state, &NoIndex, &geometry(), &target(), false, 60, &entry(3, 100)).unwrap());
    }

    #[test]
    fn test_moot_metastream_entries_drop() {
        let state = FixedState {
            colliding: false,
            by_hash: Some(IndexExecInfo::Metastream(MetastreamExecInfo {
                is_tombstoned: true,
                discard_point: DiscardPoint::keep_all(),
            })),
            by_name: None,
            range: None,
        };
        assert!(!should_keep_entry(&state, &NoIndex, &geometry(), &target(), false, 60, &entry(0, 100)).unwrap());
    }
}
