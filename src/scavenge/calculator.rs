//! Scavenge stage 2: turn retention facts into discard points and
//! chunk weights.
//!
//! The calculator walks the active original streams in stable handle
//! order, computes the definite and the max-age "maybe" discard point
//! for each, and attributes one weight unit per newly discardable event
//! to the chunk holding it. A second pass weighs discardable metastream
//! records. Both passes resume from the checkpointed handle.

use anyhow::Error;

use evl_api_types::{ScavengeStatus, ScavengeTuning};
use evl_chunklog::{ChunkGeometry, IndexReader, ScavengePoint, StreamHandle};
use evl_tools::task::WorkerTaskContext;

use super::checkpoint::ScavengeCheckpoint;
use super::discard_point::DiscardPoint;
use super::state::{
    MetastreamData, OriginalStreamData, ScavengeState, StateForCalculator, StreamStatus,
};

/// Index infos fetched per call while walking a stream.
const EVENT_INFO_SLICE: usize = 100;

/// Weight of one discardable event.
const DISCARD_WEIGHT: f32 = 1.0;

/// Weight of one discardable metastream record. Metadata replacement is
/// costlier to leave behind than a plain event (the record plus its
/// pending commit), so it counts double.
const METASTREAM_DISCARD_WEIGHT: f32 = 2.0;

pub fn calculate(
    state: &mut ScavengeState,
    index: &dyn IndexReader,
    geometry: &ChunkGeometry,
    target: &ScavengePoint,
    tuning: &ScavengeTuning,
    resume_originals_done: bool,
    resume_handle: Option<StreamHandle>,
    status: &mut ScavengeStatus,
    worker: &dyn WorkerTaskContext,
) -> Result<(), Error> {
    let batch_size = tuning.calculator_checkpoint_batch();
    let skew = tuning.skew_tolerance();

    if !resume_originals_done {
        let mut after = resume_handle.clone();
        loop {
            worker.check_abort()?;

            let mut tx = state.begin();
            let batch = tx.next_active_original_streams(after.as_ref(), batch_size);
            let Some((last_handle, _)) = batch.last() else {
                break;
            };
            after = Some(last_handle.clone());

            for (handle, data) in &batch {
                calculate_original_stream(&mut tx, index, geometry, target, skew, handle, data)?;
                status.streams_calculated += 1;
            }

            tx.commit(ScavengeCheckpoint::Calculating {
                scavenge_point: target.clone(),
                originals_done: false,
                done_handle: after.clone(),
            })?;
        }

        let tx = state.begin();
        tx.commit(ScavengeCheckpoint::Calculating {
            scavenge_point: target.clone(),
            originals_done: true,
            done_handle: None,
        })?;
    }

    let mut after = if resume_originals_done {
        resume_handle
    } else {
        None
    };
    loop {
        worker.check_abort()?;

        let mut tx = state.begin();
        let batch = tx.next_metastreams(after.as_ref(), batch_size);
        let Some((last_handle, _)) = batch.last() else {
            break;
        };
        after = Some(last_handle.clone());

        for (handle, data) in &batch {
            weigh_metastream(&mut tx, index, geometry, target, handle, data)?;
            status.metastreams_calculated += 1;
        }

        tx.commit(ScavengeCheckpoint::Calculating {
            scavenge_point: target.clone(),
            originals_done: true,
            done_handle: after.clone(),
        })?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn calculate_original_stream(
    tx: &mut dyn StateForCalculator,
    index: &dyn IndexReader,
    geometry: &ChunkGeometry,
    target: &ScavengePoint,
    skew: i64,
    handle: &StreamHandle,
    data: &OriginalStreamData,
) -> Result<(), Error> {
    let Some(last) = index.last_event_number(handle, target)? else {
        // nothing indexed below the scavenge point; the stream started
        // after it and this round must not touch it
        return Ok(());
    };

    let mut definite = data.discard_point;
    if !data.is_tombstoned {
        if let Some(truncate_before) = data.metadata.truncate_before {
            definite = definite.or(DiscardPoint::discard_before(truncate_before));
        }
        if let Some(max_count) = data.metadata.max_count {
            definite = definite.or(DiscardPoint::discard_including(last - max_count)?);
        }
        // the last event of a stream is always kept
        let cap = DiscardPoint::discard_before(last);
        if definite > cap {
            definite = cap;
        }
    }

    let cutoff = if data.is_tombstoned {
        None
    } else {
        data.metadata.max_age.map(|age| target.cutoff(age))
    };
    let mut maybe = definite.or(data.maybe_discard_point);

    // Weigh every index entry still present below the discard pair. Index
    // entries of previously executed rounds are gone, so each discardable
    // event is counted once per executed round at most.
    let mut from = 0;
    'walk: loop {
        let infos = index.read_event_info_forward(handle, from, EVENT_INFO_SLICE, target)?;
        let Some(last_info) = infos.last() else {
            break;
        };
        from = last_info.event_number + 1;

        for info in &infos {
            if info.event_number >= last {
                break 'walk;
            }
            let chunk = geometry.chunk_number(info.log_position);
            if definite.should_discard(info.event_number) {
                tx.add_chunk_weight(chunk, DISCARD_WEIGHT);
                continue;
            }

            // max-age extends the maybe point one contiguous event at a
            // time, and only over chunks whose whole observed timestamp
            // range lies behind the cutoff
            let Some(cutoff) = cutoff else { break 'walk };
            if info.event_number != maybe.first_event_number_to_keep() {
                break 'walk;
            }
            let chunk_is_old = tx
                .time_range(chunk)
                .map(|range| range.max < cutoff - skew)
                .unwrap_or(false);
            if !chunk_is_old {
                break 'walk;
            }
            maybe = DiscardPoint::discard_including(info.event_number)?;
            tx.add_chunk_weight(chunk, DISCARD_WEIGHT);
        }
    }

    let new_status = if data.is_tombstoned {
        StreamStatus::Archived
    } else if data.metadata.is_empty() && definite.is_keep_all() && maybe.is_keep_all() {
        StreamStatus::Spent
    } else {
        StreamStatus::Active
    };

    tx.set_original_stream_calculation(handle, new_status, definite, maybe)
}

fn weigh_metastream(
    tx: &mut dyn StateForCalculator,
    index: &dyn IndexReader,
    geometry: &ChunkGeometry,
    target: &ScavengePoint,
    handle: &StreamHandle,
    data: &MetastreamData,
) -> Result<(), Error> {
    let mut from = 0;
    loop {
        let infos = index.read_event_info_forward(handle, from, EVENT_INFO_SLICE, target)?;
        let Some(last_info) = infos.last() else {
            return Ok(());
        };
        from = last_info.event_number + 1;

        for info in &infos {
            // a tombstoned stream makes its whole metastream moot
            let discardable =
                data.is_tombstoned || data.discard_point.should_discard(info.event_number);
            if !discardable {
                // ascending walk, nothing further can be discardable
                return Ok(());
            }
            tx.add_chunk_weight(
                geometry.chunk_number(info.log_position),
                METASTREAM_DISCARD_WEIGHT,
            );
        }
    }
}
