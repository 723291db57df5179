//! The scavenge pipeline.
//!
//! A run picks (or writes) its target scavenge point, then drives the
//! stages strictly in order: accumulate, calculate, execute chunks,
//! merge chunks, execute the index, clean. Progress lives in the durable
//! [`ScavengeCheckpoint`]; after any interruption the next run re-enters
//! the stage the checkpoint names and continues from its sub-progress.

use std::time::Instant;

use anyhow::{bail, Error};

use proxmox_human_byte::HumanByte;

use evl_api_types::{ScavengeOutcome, ScavengeStatus, ScavengeTuning};
use evl_chunklog::{
    ChunkGeometry, ChunkManager, Clock, IndexReader, IndexWriter, MetastreamLookup, ScavengePoint,
    ScavengePointSource,
};
use evl_tools::task::WorkerTaskContext;
use evl_tools::{task_log, task_warn};

pub mod accumulator;
pub mod calculator;
pub mod checkpoint;
pub mod chunk_executor;
pub mod cleaner;
pub mod discard_point;
pub mod error;
pub mod index_executor;
pub mod runner;
pub mod state;
pub mod throttle;

pub use checkpoint::ScavengeCheckpoint;
pub use discard_point::DiscardPoint;
pub use error::ScavengeError;

use runner::ScavengeParams;
use state::ScavengeState;

/// One scavenge run over the ports of the hosting node.
pub struct Scavenger<'a> {
    pub state: &'a mut ScavengeState,
    pub chunk_manager: &'a dyn ChunkManager,
    pub index_reader: &'a dyn IndexReader,
    pub index_writer: &'a mut dyn IndexWriter,
    pub metastreams: &'a dyn MetastreamLookup,
    pub scavenge_points: &'a mut dyn ScavengePointSource,
    pub clock: &'a dyn Clock,
    pub tuning: &'a ScavengeTuning,
    pub params: ScavengeParams,
}

impl Scavenger<'_> {
    /// Run to completion (or to the cooperative stop).
    ///
    /// `Ok` carries the status with outcome `Success` or `Stopped`;
    /// `Err` means the run failed and resumes from its checkpoint next
    /// time.
    pub fn run(&mut self, worker: &dyn WorkerTaskContext) -> Result<ScavengeStatus, Error> {
        let started = Instant::now();
        let mut status = ScavengeStatus::default();

        let result = self.run_stages(&mut status, worker);
        status.elapsed_sec = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                status.outcome = Some(ScavengeOutcome::Success);
                self.report(&status, worker);
                Ok(status)
            }
            Err(err) => {
                let stopped = worker.abort_requested()
                    || err
                        .downcast_ref::<ScavengeError>()
                        .map(ScavengeError::is_stop)
                        .unwrap_or(false);
                if stopped {
                    task_warn!(worker, "scavenge stopped: {err}");
                    status.outcome = Some(ScavengeOutcome::Stopped);
                    self.report(&status, worker);
                    Ok(status)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn run_stages(
        &mut self,
        status: &mut ScavengeStatus,
        worker: &dyn WorkerTaskContext,
    ) -> Result<(), Error> {
        let geometry = ChunkGeometry::new(self.chunk_manager.chunk_size())?;
        if let Some(configured) = self.tuning.chunk_size {
            if configured != geometry.chunk_size() {
                bail!(
                    "configured chunk size {configured} does not match the log's chunk size {}",
                    geometry.chunk_size(),
                );
            }
        }

        // Pick the target scavenge point: resume the stored round if one
        // is in flight, otherwise start a round against the latest point
        // in the log (writing one if there is none to do).
        match self.state.checkpoint().cloned() {
            None => {
                let target = self.fresh_target(None)?;
                self.enter_accumulation(None, &target, &geometry)?;
            }
            Some(ScavengeCheckpoint::Done { scavenge_point }) => {
                let target = self.fresh_target(Some(&scavenge_point))?;
                self.enter_accumulation(Some(&scavenge_point), &target, &geometry)?;
            }
            Some(resumed) => {
                task_log!(
                    worker,
                    "resuming scavenge {} at stage '{}'",
                    resumed.scavenge_point(),
                    resumed.stage_name(),
                );
            }
        }

        loop {
            worker.check_abort()?;

            let checkpoint = match self.state.checkpoint() {
                Some(checkpoint) => checkpoint.clone(),
                None => bail!("scavenge checkpoint vanished mid-run"),
            };
            status.scavenge_point = Some(checkpoint.scavenge_point().event_number);

            match checkpoint {
                ScavengeCheckpoint::Accumulating {
                    scavenge_point,
                    done_logical_chunk,
                } => {
                    accumulator::accumulate(
                        self.state,
                        self.chunk_manager,
                        self.metastreams,
                        &geometry,
                        &scavenge_point,
                        done_logical_chunk,
                        status,
                        worker,
                    )?;
                    self.transition(ScavengeCheckpoint::Calculating {
                        scavenge_point,
                        originals_done: false,
                        done_handle: None,
                    })?;
                }
                ScavengeCheckpoint::Calculating {
                    scavenge_point,
                    originals_done,
                    done_handle,
                } => {
                    calculator::calculate(
                        self.state,
                        self.index_reader,
                        &geometry,
                        &scavenge_point,
                        self.tuning,
                        originals_done,
                        done_handle,
                        status,
                        worker,
                    )?;
                    self.transition(ScavengeCheckpoint::ExecutingChunks {
                        scavenge_point,
                        done_logical_chunk: self
                            .params
                            .start_from_chunk
                            .map(|chunk| chunk - 1)
                            .filter(|done| *done >= 0),
                    })?;
                }
                ScavengeCheckpoint::ExecutingChunks {
                    scavenge_point,
                    done_logical_chunk,
                } => {
                    chunk_executor::execute_chunks(
                        self.state,
                        self.chunk_manager,
                        self.metastreams,
                        &geometry,
                        &scavenge_point,
                        self.tuning,
                        self.params.start_from_chunk,
                        done_logical_chunk,
                        status,
                        worker,
                    )?;
                    self.transition(ScavengeCheckpoint::MergingChunks { scavenge_point })?;
                }
                ScavengeCheckpoint::MergingChunks { scavenge_point } => {
                    self.chunk_manager.merge_chunks(worker)?;
                    self.transition(ScavengeCheckpoint::ExecutingIndex { scavenge_point })?;
                }
                ScavengeCheckpoint::ExecutingIndex { scavenge_point } => {
                    index_executor::execute_index(
                        &*self.state,
                        self.index_reader,
                        self.index_writer,
                        &geometry,
                        &scavenge_point,
                        self.tuning,
                        self.params.threads.max(1),
                        status,
                        worker,
                    )?;
                    self.transition(ScavengeCheckpoint::Cleaning { scavenge_point })?;
                }
                ScavengeCheckpoint::Cleaning { scavenge_point } => {
                    // commits the Done checkpoint itself; the round is
                    // over, don't fall into another abort poll
                    cleaner::clean(
                        self.state,
                        &scavenge_point,
                        self.tuning.unsafe_ignore_hard_deletes(),
                        status,
                        worker,
                    )?;
                    break;
                }
                ScavengeCheckpoint::Done { .. } => break,
            }
        }

        Ok(())
    }

    /// Latest scavenge point newer than `previous`, appending a fresh
    /// one when the log has none.
    fn fresh_target(&mut self, previous: Option<&ScavengePoint>) -> Result<ScavengePoint, Error> {
        if let Some(latest) = self.scavenge_points.latest()? {
            let is_new = previous
                .map(|prev| latest.event_number > prev.event_number)
                .unwrap_or(true);
            if is_new {
                return Ok(latest);
            }
        }
        self.scavenge_points
            .append(self.clock.now(), self.tuning.threshold())
    }

    fn enter_accumulation(
        &mut self,
        source: Option<&ScavengePoint>,
        target: &ScavengePoint,
        geometry: &ChunkGeometry,
    ) -> Result<(), Error> {
        // accumulation starts at the chunk containing the source point
        // (chunk 0 without one)
        let done_logical_chunk = source
            .map(|sp| geometry.chunk_number(sp.position) - 1)
            .filter(|done| *done >= 0);
        self.transition(ScavengeCheckpoint::Accumulating {
            scavenge_point: target.clone(),
            done_logical_chunk,
        })
    }

    fn transition(&mut self, checkpoint: ScavengeCheckpoint) -> Result<(), Error> {
        let tx = self.state.begin();
        tx.commit(checkpoint)
    }

    fn report(&self, status: &ScavengeStatus, worker: &dyn WorkerTaskContext) {
        if let Some(outcome) = status.outcome {
            task_log!(worker, "scavenge finished: {outcome}");
        }
        task_log!(
            worker,
            "accumulated chunks: {}, calculated streams: {} (+{} metastreams)",
            status.chunks_accumulated,
            status.streams_calculated,
            status.metastreams_calculated,
        );
        task_log!(
            worker,
            "chunks rewritten: {}, skipped: {}",
            status.chunks_rewritten,
            status.chunks_skipped,
        );
        task_log!(
            worker,
            "discarded records: {}, reclaimed: {}",
            status.records_discarded,
            HumanByte::from(status.reclaimed_bytes),
        );
        task_log!(
            worker,
            "index entries dropped: {}, state entries cleaned: {}",
            status.index_entries_dropped,
            status.state_entries_cleaned,
        );
    }
}
