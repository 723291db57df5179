//! Scavenge stage 3: rewrite chunk files whose weight is above the
//! threshold.
//!
//! Each selected chunk is streamed into a fresh temp chunk keeping only
//! the records retention spares; completion atomically swaps the new
//! file in, resets the chunk's weights and commits the per-chunk
//! checkpoint in one transaction. Light chunks are skipped, their weight
//! stays around for a later round.

use std::time::Instant;

use anyhow::Error;

use proxmox_human_byte::HumanByte;

use evl_api_types::{ScavengeStatus, ScavengeTuning};
use evl_chunklog::{
    ChunkGeometry, ChunkManager, ChunkReader, ChunkWriter, MetastreamLookup, PrepareRecord,
    RecordKind, ScavengePoint, SystemRecord, SCAVENGES_STREAM,
};
use evl_tools::task::WorkerTaskContext;
use evl_tools::{task_log, task_warn};

use super::checkpoint::ScavengeCheckpoint;
use super::error::ScavengeError;
use super::state::{ScavengeState, StateForChunkExecutor};
use super::throttle::Throttle;

#[allow(clippy::too_many_arguments)]
pub fn execute_chunks(
    state: &mut ScavengeState,
    chunk_manager: &dyn ChunkManager,
    metastreams: &dyn MetastreamLookup,
    geometry: &ChunkGeometry,
    target: &ScavengePoint,
    tuning: &ScavengeTuning,
    start_from_chunk: Option<i64>,
    done_logical_chunk: Option<i64>,
    status: &mut ScavengeStatus,
    worker: &dyn WorkerTaskContext,
) -> Result<(), Error> {
    let target_chunk = geometry.chunk_number(target.position);
    let throttle = Throttle::new(tuning.throttle_percent());
    let unsafe_mode = tuning.unsafe_ignore_hard_deletes();

    let mut chunk = match done_logical_chunk {
        Some(done) => done + 1,
        None => start_from_chunk.unwrap_or(0),
    };

    while chunk <= target_chunk {
        worker.check_abort()?;

        let mut reader =
            chunk_manager.get_chunk_reader_for(geometry.chunk_start_position(chunk))?;
        let (start, end) = (reader.chunk_start_number(), reader.chunk_end_number());

        let weight = state.sum_chunk_weights(start, end);
        let over_threshold = target.threshold >= 0 && weight > target.threshold as f32;
        // the head chunk is still being written and never rewritten
        if !reader.is_read_only() || !(over_threshold || unsafe_mode) {
            status.chunks_skipped += 1;
            let tx = state.begin();
            tx.commit(ScavengeCheckpoint::ExecutingChunks {
                scavenge_point: target.clone(),
                done_logical_chunk: Some(end),
            })?;
            chunk = end + 1;
            continue;
        }

        let started = Instant::now();
        rewrite_chunk(
            state,
            chunk_manager,
            reader.as_mut(),
            metastreams,
            target,
            tuning,
            unsafe_mode,
            status,
            worker,
        )?;

        let mut tx = state.begin();
        tx.reset_chunk_weights(start, end);
        tx.commit(ScavengeCheckpoint::ExecutingChunks {
            scavenge_point: target.clone(),
            done_logical_chunk: Some(end),
        })?;
        status.chunks_rewritten += 1;

        throttle.pause(started.elapsed());
        chunk = end + 1;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn rewrite_chunk(
    state: &ScavengeState,
    chunk_manager: &dyn ChunkManager,
    reader: &mut dyn ChunkReader,
    metastreams: &dyn MetastreamLookup,
    target: &ScavengePoint,
    tuning: &ScavengeTuning,
    unsafe_mode: bool,
    status: &mut ScavengeStatus,
    worker: &dyn WorkerTaskContext,
) -> Result<(), Error> {
    let old_size = reader.file_size();
    let name = reader.name().to_string();
    let mut writer = chunk_manager.create_chunk_writer(reader)?;

    match copy_kept_records(
        state,
        reader,
        writer.as_mut(),
        metastreams,
        target,
        tuning,
        unsafe_mode,
        worker,
    ) {
        Ok(discarded) => {
            let (new_name, new_size) = writer.complete()?;
            status.records_discarded += discarded;
            status.reclaimed_bytes += old_size.saturating_sub(new_size);
            task_log!(
                worker,
                "rewrote chunk {} as {} ({} records dropped, {} reclaimed)",
                name,
                new_name,
                discarded,
                HumanByte::from(old_size.saturating_sub(new_size)),
            );
            Ok(())
        }
        Err(err) => {
            let cancelled = worker.abort_requested()
                || matches!(
                    err.downcast_ref::<ScavengeError>(),
                    Some(ScavengeError::Cancelled)
                );
            if cancelled {
                // keep the temp file, the next run starts this chunk over
                writer.abort(false);
            } else {
                if matches!(
                    err.downcast_ref::<ScavengeError>(),
                    Some(ScavengeError::ChunkBeingDeleted { .. })
                ) {
                    task_warn!(worker, "chunk {name} vanished during rewrite, stopping");
                }
                writer.abort(true);
            }
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn copy_kept_records(
    state: &ScavengeState,
    reader: &mut dyn ChunkReader,
    writer: &mut dyn ChunkWriter,
    metastreams: &dyn MetastreamLookup,
    target: &ScavengePoint,
    tuning: &ScavengeTuning,
    unsafe_mode: bool,
    worker: &dyn WorkerTaskContext,
) -> Result<u64, Error> {
    let check_period = tuning.cancellation_check_period();
    let mut prepare = PrepareRecord::default();
    let mut system = SystemRecord::default();
    let mut seen: usize = 0;
    let mut discarded: u64 = 0;

    while let Some(kind) = reader.next_record(&mut prepare, &mut system)? {
        seen += 1;
        if seen % check_period == 0 {
            worker.check_abort()?;
        }

        match kind {
            RecordKind::System => writer.write_system(&system)?,
            RecordKind::Prepare => {
                if should_discard(state, metastreams, target, unsafe_mode, &prepare)? {
                    discarded += 1;
                } else {
                    writer.write_prepare(&prepare)?;
                }
            }
        }
    }

    Ok(discarded)
}

/// The per-record retention decision.
fn should_discard(
    state: &dyn StateForChunkExecutor,
    metastreams: &dyn MetastreamLookup,
    target: &ScavengePoint,
    unsafe_mode: bool,
    prepare: &PrepareRecord,
) -> Result<bool, Error> {
    // nothing at or past the scavenge point is touched by this round
    if prepare.log_position >= target.position {
        return Ok(false);
    }
    // open transactions are out of scope, keep their prepares
    if !prepare.is_self_committed() {
        return Ok(false);
    }
    // scavenge point markers are kept
    if prepare.stream_id == SCAVENGES_STREAM {
        return Ok(false);
    }

    if metastreams.is_metastream(&prepare.stream_id) {
        let Some(info) = state.metastream_exec_info(&prepare.stream_id) else {
            return Ok(false);
        };
        if prepare.is_tombstone() {
            // the accumulator fails the run on these, finding one here
            // means the state cannot match the log
            return Err(ScavengeError::CorruptState(format!(
                "tombstone record in metastream '{}' survived accumulation",
                prepare.stream_id
            ))
            .into());
        }
        if info.is_tombstoned {
            // the whole metastream of a tombstoned stream is moot
            return Ok(true);
        }
        return Ok(info.discard_point.should_discard(prepare.event_number));
    }

    let Some(info) = state.original_exec_info(&prepare.stream_id) else {
        return Ok(false);
    };
    if info.is_tombstoned && unsafe_mode {
        return Ok(true);
    }
    if prepare.is_tombstone() {
        return Ok(false);
    }
    if info.discard_point.should_discard(prepare.event_number) {
        return Ok(true);
    }
    if let Some(max_age) = info.max_age {
        if info.maybe_discard_point.should_discard(prepare.event_number)
            && prepare.timestamp < target.cutoff(max_age)
        {
            return Ok(true);
        }
    }
    Ok(false)
}
