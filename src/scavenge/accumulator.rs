//! Scavenge stage 1: sweep the log and materialise retention facts.
//!
//! The accumulator reads every record between the previous and the
//! target scavenge point and turns metadata events, tombstones and
//! record timestamps into scavenge state. All state operations are
//! idempotent, so re-sweeping a partially accumulated chunk after a
//! restart is harmless.

use anyhow::Error;

use evl_api_types::ScavengeStatus;
use evl_chunklog::{
    ChunkGeometry, ChunkManager, ChunkReader, MetastreamLookup, PrepareRecord, RecordKind,
    ScavengePoint, StreamMetadata, SystemRecord, SCAVENGES_STREAM,
};
use evl_tools::task::WorkerTaskContext;
use evl_tools::task_log;

use super::checkpoint::ScavengeCheckpoint;
use super::discard_point::DiscardPoint;
use super::error::ScavengeError;
use super::state::{ScavengeState, StateForAccumulator};

/// Sweep from `done_logical_chunk + 1` (the chunk containing the source
/// scavenge point on a fresh run) up to and including the target
/// scavenge point, committing one checkpoint per physical chunk.
pub fn accumulate(
    state: &mut ScavengeState,
    chunk_manager: &dyn ChunkManager,
    metastreams: &dyn MetastreamLookup,
    geometry: &ChunkGeometry,
    target: &ScavengePoint,
    done_logical_chunk: Option<i64>,
    status: &mut ScavengeStatus,
    worker: &dyn WorkerTaskContext,
) -> Result<(), Error> {
    let target_chunk = geometry.chunk_number(target.position);

    let mut chunk = done_logical_chunk.map(|done| done + 1).unwrap_or(0);

    while chunk <= target_chunk {
        worker.check_abort()?;

        let mut reader =
            chunk_manager.get_chunk_reader_for(geometry.chunk_start_position(chunk))?;
        let end_number = reader.chunk_end_number();

        let mut tx = state.begin();
        let reached_target =
            accumulate_chunk(&mut tx, reader.as_mut(), metastreams, geometry, target)?;
        tx.commit(ScavengeCheckpoint::Accumulating {
            scavenge_point: target.clone(),
            done_logical_chunk: Some(end_number),
        })?;

        status.chunks_accumulated += (end_number - chunk + 1) as usize;
        task_log!(
            worker,
            "accumulated chunk {} (logical {}-{})",
            reader.name(),
            reader.chunk_start_number(),
            end_number,
        );

        if reached_target {
            break;
        }
        chunk = end_number + 1;
    }

    Ok(())
}

/// Returns true once the target scavenge point record was reached.
fn accumulate_chunk(
    tx: &mut dyn StateForAccumulator,
    reader: &mut dyn ChunkReader,
    metastreams: &dyn MetastreamLookup,
    geometry: &ChunkGeometry,
    target: &ScavengePoint,
) -> Result<bool, Error> {
    let mut prepare = PrepareRecord::default();
    let mut system = SystemRecord::default();

    while let Some(kind) = reader.next_record(&mut prepare, &mut system)? {
        if kind != RecordKind::Prepare {
            continue;
        }

        tx.note_record_timestamp(geometry.chunk_number(prepare.log_position), prepare.timestamp);

        if metastreams.is_metastream(&prepare.stream_id) {
            accumulate_metastream_record(tx, metastreams, &prepare)?;
        } else if prepare.is_tombstone() {
            let handle = tx.stream_handle(&prepare.stream_id)?;
            tx.set_original_stream_tombstoned(&prepare.stream_id, prepare.event_number)?;
            tx.set_metastream_tombstoned(
                &metastreams.metastream_of(&prepare.stream_id),
                handle.hash(),
            )?;
        } else {
            // every stream name in the log goes through collision
            // detection, plain events included
            tx.stream_handle(&prepare.stream_id)?;
        }

        // the target scavenge point is the sweep boundary
        if prepare.stream_id == SCAVENGES_STREAM && prepare.log_position >= target.position {
            return Ok(true);
        }
    }

    Ok(false)
}

fn accumulate_metastream_record(
    tx: &mut dyn StateForAccumulator,
    metastreams: &dyn MetastreamLookup,
    prepare: &PrepareRecord,
) -> Result<(), Error> {
    if prepare.is_tombstone() {
        return Err(ScavengeError::InvalidMetastreamOperation {
            stream: prepare.stream_id.clone(),
            position: prepare.log_position,
        }
        .into());
    }
    tx.stream_handle(&prepare.stream_id)?;
    if !prepare.is_self_committed() {
        // metadata in an open transaction is not effective yet
        return Ok(());
    }

    let original = metastreams.original_stream_of(&prepare.stream_id);
    let metadata = StreamMetadata::parse(&prepare.payload);

    let original_handle = tx.stream_handle(original)?;
    tx.set_original_stream_metadata(original, metadata)?;
    // older metadata events become discardable, only the latest stays
    tx.set_metastream_discard_point(
        &prepare.stream_id,
        original_handle.hash(),
        DiscardPoint::discard_before(prepare.event_number),
    )?;

    Ok(())
}
