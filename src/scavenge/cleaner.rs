//! Scavenge stage 5: prune state that has no retention work left.
//!
//! Spent original streams go unconditionally; archived (tombstoned)
//! ones only when the operator runs with unsafe-ignore-hard-deletes,
//! since a safe run must keep special-casing their tombstone forever.
//! Metastream entries follow their underlying stream out.

use anyhow::Error;

use evl_api_types::ScavengeStatus;
use evl_chunklog::ScavengePoint;
use evl_tools::task::WorkerTaskContext;
use evl_tools::task_log;

use super::checkpoint::ScavengeCheckpoint;
use super::state::{ScavengeState, StateForCleaner, StreamStatus};

pub fn clean(
    state: &mut ScavengeState,
    target: &ScavengePoint,
    reclaim_archived: bool,
    status: &mut ScavengeStatus,
    worker: &dyn WorkerTaskContext,
) -> Result<(), Error> {
    worker.check_abort()?;

    let mut tx = state.begin();
    let mut removed = 0;

    let removable = |stream_status: StreamStatus| match stream_status {
        StreamStatus::Spent => true,
        StreamStatus::Archived => reclaim_archived,
        StreamStatus::Active => false,
    };

    // metastream entries go when every original stream under their hash
    // is going too (several only when the hash collides)
    for (handle, original_hash) in tx.metastreams_snapshot() {
        let statuses = tx.statuses_for_hash(original_hash);
        if statuses.iter().all(|s| removable(*s)) {
            tx.remove_metastream(&handle);
            removed += 1;
        }
    }

    for (handle, stream_status) in tx.original_streams_snapshot() {
        if removable(stream_status) {
            tx.remove_original_stream(&handle);
            removed += 1;
        }
    }

    tx.commit(ScavengeCheckpoint::Done {
        scavenge_point: target.clone(),
    })?;

    status.state_entries_cleaned += removed;
    task_log!(worker, "cleaned {removed} spent state entries");

    Ok(())
}
