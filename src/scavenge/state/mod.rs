//! Durable scavenge state.
//!
//! This is the single mutable ground truth of the pipeline: which hashes
//! collide, what retention facts were accumulated per stream, how much
//! weight every chunk carries and how far the current run has come. All
//! mutations go through a [`StateTransaction`]; a transaction either
//! commits together with a checkpoint (serializing the state and
//! atomically replacing the state file) or rolls back without leaving a
//! trace.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{format_err, Context, Error};
use serde::{Deserialize, Serialize};

use proxmox_sys::fs::{file_read_optional_string, replace_file, CreateOptions};

use evl_chunklog::{StreamHandle, StreamHasher, StreamMetadata};
use evl_tools::lru_cache::{Cacher, LruCache};

use super::checkpoint::ScavengeCheckpoint;
use super::discard_point::DiscardPoint;

pub mod collision_map;
pub use collision_map::CollisionMap;

/// Where an original stream is in its retention lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Has (or may have) retention work left.
    Active,
    /// No retention configured and nothing left to discard; the cleaner
    /// removes the entry.
    Spent,
    /// Tombstoned; only the tombstone survives.
    Archived,
}

/// Per original stream facts, created by the accumulator and refined by
/// the calculator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OriginalStreamData {
    pub metadata: StreamMetadata,
    pub is_tombstoned: bool,
    pub status: StreamStatus,
    /// Definite lower bound: events below it are discardable no matter
    /// what.
    pub discard_point: DiscardPoint,
    /// Tentative max-age bound; the chunk executor confirms it against
    /// each record's own timestamp.
    pub maybe_discard_point: DiscardPoint,
}

impl Default for OriginalStreamData {
    fn default() -> Self {
        OriginalStreamData {
            metadata: StreamMetadata::default(),
            is_tombstoned: false,
            status: StreamStatus::Active,
            discard_point: DiscardPoint::keep_all(),
            maybe_discard_point: DiscardPoint::keep_all(),
        }
    }
}

/// Per metastream facts. `is_tombstoned` refers to the underlying
/// original stream; a tombstoned metastream itself is illegal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetastreamData {
    pub original_stream_hash: u64,
    pub discard_point: DiscardPoint,
    pub is_tombstoned: bool,
}

/// Observed timestamp range of the prepares in one logical chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTimeRange {
    pub min: i64,
    pub max: i64,
}

impl ChunkTimeRange {
    fn fold(&mut self, timestamp: i64) {
        self.min = self.min.min(timestamp);
        self.max = self.max.max(timestamp);
    }
}

/// What the chunk executor needs to judge a prepare of an original
/// stream.
#[derive(Clone, Debug)]
pub struct OriginalExecInfo {
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
    pub maybe_discard_point: DiscardPoint,
    pub max_age: Option<i64>,
}

/// What the chunk executor needs to judge a prepare of a metastream.
#[derive(Clone, Debug)]
pub struct MetastreamExecInfo {
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
}

/// Execution facts for an index entry, resolved by hash or name.
#[derive(Clone, Debug)]
pub enum IndexExecInfo {
    Original(OriginalExecInfo),
    Metastream(MetastreamExecInfo),
}

/// The serialized portion of the state. One JSON document, replaced
/// atomically on every checkpoint commit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StateData {
    collisions: BTreeSet<String>,
    hashes: BTreeMap<u64, String>,
    metastreams: CollisionMap<MetastreamData>,
    original_streams: CollisionMap<OriginalStreamData>,
    chunk_time_ranges: BTreeMap<i64, ChunkTimeRange>,
    chunk_weights: BTreeMap<i64, f32>,
    checkpoint: Option<ScavengeCheckpoint>,
}

pub struct ScavengeState {
    path: PathBuf,
    _lock: std::fs::File,
    hasher: Arc<dyn StreamHasher + Send + Sync>,
    data: StateData,
    // derived, rebuilt on open and rollback
    colliding_hashes: BTreeSet<u64>,
    hash_cache: LruCache<u64, String>,
}

struct HashesCacher<'a> {
    hashes: &'a BTreeMap<u64, String>,
}

impl Cacher<u64, String> for HashesCacher<'_> {
    fn fetch(&mut self, key: u64) -> Result<Option<String>, Error> {
        Ok(self.hashes.get(&key).cloned())
    }
}

impl ScavengeState {
    /// Open (or create) the state file at `path` and take the exclusive
    /// state lock next to it.
    pub fn open(
        path: &Path,
        hasher: Arc<dyn StreamHasher + Send + Sync>,
        hash_cache_capacity: usize,
    ) -> Result<Self, Error> {
        let mut lock_path = path.to_path_buf();
        lock_path.set_extension("lck");
        let lock = proxmox_sys::fs::open_file_locked(
            &lock_path,
            Duration::new(10, 0),
            true,
            CreateOptions::new(),
        )
        .map_err(|err| format_err!("unable to lock scavenge state {path:?} - {err}"))?;

        let data = match file_read_optional_string(path)? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("unable to parse scavenge state {path:?}"))?,
            None => StateData::default(),
        };

        let mut state = ScavengeState {
            path: path.to_path_buf(),
            _lock: lock,
            hasher,
            data,
            colliding_hashes: BTreeSet::new(),
            hash_cache: LruCache::new(hash_cache_capacity),
        };
        state.rebuild_derived();
        Ok(state)
    }

    fn rebuild_derived(&mut self) {
        self.colliding_hashes = self
            .data
            .collisions
            .iter()
            .map(|name| self.hasher.hash(name))
            .collect();
        self.hash_cache.clear();
    }

    fn persist(&self) -> Result<(), Error> {
        let raw = serde_json::to_string(&self.data)?;
        replace_file(&self.path, raw.as_bytes(), CreateOptions::new(), true)
            .map_err(|err| format_err!("unable to write scavenge state {:?} - {err}", self.path))
    }

    /// Start a transaction. All mutations go through the returned guard;
    /// dropping it without [`StateTransaction::commit`] rolls them back.
    pub fn begin(&mut self) -> StateTransaction<'_> {
        let undo = self.data.clone();
        StateTransaction {
            state: self,
            undo: Some(undo),
        }
    }

    pub fn checkpoint(&self) -> Option<&ScavengeCheckpoint> {
        self.data.checkpoint.as_ref()
    }

    pub fn hasher(&self) -> &Arc<dyn StreamHasher + Send + Sync> {
        &self.hasher
    }

    pub fn is_colliding(&self, stream_id: &str) -> bool {
        self.data.collisions.contains(stream_id)
    }

    /// The handle a stream is currently tracked under. Unlike
    /// [`StateForAccumulator::stream_handle`] this never records
    /// anything.
    pub fn resolve_handle(&self, stream_id: &str) -> StreamHandle {
        let hash = self.hasher.hash(stream_id);
        if self.is_colliding(stream_id) {
            StreamHandle::Id {
                id: stream_id.to_string(),
                hash,
            }
        } else {
            StreamHandle::Hash(hash)
        }
    }

    pub fn collisions(&self) -> &BTreeSet<String> {
        &self.data.collisions
    }

    pub fn original_stream(&self, handle: &StreamHandle) -> Option<&OriginalStreamData> {
        self.data.original_streams.get(handle)
    }

    pub fn metastream(&self, handle: &StreamHandle) -> Option<&MetastreamData> {
        self.data.metastreams.get(handle)
    }

    pub fn original_stream_count(&self) -> usize {
        self.data.original_streams.len()
    }

    pub fn metastream_count(&self) -> usize {
        self.data.metastreams.len()
    }

    pub fn chunk_weight(&self, logical_chunk: i64) -> f32 {
        self.data
            .chunk_weights
            .get(&logical_chunk)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn chunk_time_range(&self, logical_chunk: i64) -> Option<ChunkTimeRange> {
        self.data.chunk_time_ranges.get(&logical_chunk).copied()
    }

    fn hash_of(&self) -> impl Fn(&str) -> u64 + '_ {
        let hasher = Arc::clone(&self.hasher);
        move |name: &str| hasher.hash(name)
    }
}

/// Mutation guard over [`ScavengeState`].
pub struct StateTransaction<'a> {
    state: &'a mut ScavengeState,
    undo: Option<StateData>,
}

impl Drop for StateTransaction<'_> {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            self.state.data = undo;
            self.state.rebuild_derived();
        }
    }
}

impl StateTransaction<'_> {
    /// Commit the transaction: record the checkpoint and atomically
    /// replace the state file. On a write error the in-memory mutations
    /// are rolled back as if the transaction never ran.
    pub fn commit(mut self, checkpoint: ScavengeCheckpoint) -> Result<(), Error> {
        self.state.data.checkpoint = Some(checkpoint);
        self.state.persist()?;
        self.undo = None;
        Ok(())
    }

    /// Read view of the underlying state.
    pub fn state(&self) -> &ScavengeState {
        self.state
    }

    pub fn reset_chunk_weights(&mut self, start: i64, end: i64) {
        for chunk in start..=end {
            self.state.data.chunk_weights.remove(&chunk);
        }
    }
}

/// State surface of the accumulator.
pub trait StateForAccumulator {
    /// Collision-aware handle for a stream seen in the log. Records the
    /// hash user and, on a newly detected collision, marks both names
    /// and migrates their entries to the id side.
    fn stream_handle(&mut self, stream_id: &str) -> Result<StreamHandle, Error>;

    fn set_original_stream_metadata(
        &mut self,
        stream_id: &str,
        metadata: StreamMetadata,
    ) -> Result<(), Error>;

    fn set_metastream_discard_point(
        &mut self,
        metastream_id: &str,
        original_stream_hash: u64,
        discard_point: DiscardPoint,
    ) -> Result<(), Error>;

    fn set_original_stream_tombstoned(
        &mut self,
        stream_id: &str,
        tombstone_event_number: i64,
    ) -> Result<(), Error>;

    fn set_metastream_tombstoned(
        &mut self,
        metastream_id: &str,
        original_stream_hash: u64,
    ) -> Result<(), Error>;

    fn note_record_timestamp(&mut self, logical_chunk: i64, timestamp: i64);
}

impl StateForAccumulator for StateTransaction<'_> {
    fn stream_handle(&mut self, stream_id: &str) -> Result<StreamHandle, Error> {
        let hash = self.state.hasher.hash(stream_id);
        if self.state.data.collisions.contains(stream_id) {
            return Ok(StreamHandle::Id {
                id: stream_id.to_string(),
                hash,
            });
        }

        let existing = {
            let state = &mut *self.state;
            let mut cacher = HashesCacher {
                hashes: &state.data.hashes,
            };
            state.hash_cache.access(hash, &mut cacher)?.cloned()
        };

        match existing {
            None => {
                self.state.data.hashes.insert(hash, stream_id.to_string());
                self.state.hash_cache.insert(hash, stream_id.to_string());
                Ok(StreamHandle::Hash(hash))
            }
            Some(owner) if owner == stream_id => Ok(StreamHandle::Hash(hash)),
            Some(owner) => {
                // first collision on this hash: both names switch to the
                // id side, the owner takes its accumulated entries along
                let state = &mut *self.state;
                state.data.collisions.insert(owner.clone());
                state.data.collisions.insert(stream_id.to_string());
                state.colliding_hashes.insert(hash);
                state.data.original_streams.promote_to_id(hash, &owner);
                state.data.metastreams.promote_to_id(hash, &owner);
                Ok(StreamHandle::Id {
                    id: stream_id.to_string(),
                    hash,
                })
            }
        }
    }

    fn set_original_stream_metadata(
        &mut self,
        stream_id: &str,
        metadata: StreamMetadata,
    ) -> Result<(), Error> {
        let handle = self.stream_handle(stream_id)?;
        let entry = self
            .state
            .data
            .original_streams
            .get_or_insert_with(&handle, OriginalStreamData::default);
        entry.metadata = metadata;
        if !entry.is_tombstoned {
            // new metadata can give a spent stream new retention work
            entry.status = StreamStatus::Active;
        }
        Ok(())
    }

    fn set_metastream_discard_point(
        &mut self,
        metastream_id: &str,
        original_stream_hash: u64,
        discard_point: DiscardPoint,
    ) -> Result<(), Error> {
        let handle = self.stream_handle(metastream_id)?;
        let entry = self
            .state
            .data
            .metastreams
            .get_or_insert_with(&handle, || MetastreamData {
                original_stream_hash,
                discard_point: DiscardPoint::keep_all(),
                is_tombstoned: false,
            });
        entry.original_stream_hash = original_stream_hash;
        entry.discard_point = entry.discard_point.or(discard_point);
        Ok(())
    }

    fn set_original_stream_tombstoned(
        &mut self,
        stream_id: &str,
        tombstone_event_number: i64,
    ) -> Result<(), Error> {
        let handle = self.stream_handle(stream_id)?;
        let discard_point = DiscardPoint::discard_before(tombstone_event_number);
        let entry = self
            .state
            .data
            .original_streams
            .get_or_insert_with(&handle, OriginalStreamData::default);
        entry.is_tombstoned = true;
        entry.discard_point = entry.discard_point.or(discard_point);
        entry.maybe_discard_point = entry.maybe_discard_point.or(entry.discard_point);
        Ok(())
    }

    fn set_metastream_tombstoned(
        &mut self,
        metastream_id: &str,
        original_stream_hash: u64,
    ) -> Result<(), Error> {
        let handle = self.stream_handle(metastream_id)?;
        let entry = self
            .state
            .data
            .metastreams
            .get_or_insert_with(&handle, || MetastreamData {
                original_stream_hash,
                discard_point: DiscardPoint::keep_all(),
                is_tombstoned: false,
            });
        entry.original_stream_hash = original_stream_hash;
        entry.is_tombstoned = true;
        Ok(())
    }

    fn note_record_timestamp(&mut self, logical_chunk: i64, timestamp: i64) {
        self.state
            .data
            .chunk_time_ranges
            .entry(logical_chunk)
            .or_insert(ChunkTimeRange {
                min: timestamp,
                max: timestamp,
            })
            .fold(timestamp);
    }
}

/// State surface of the calculator.
pub trait StateForCalculator {
    /// Next batch of `Active` original streams strictly after `after` in
    /// stable handle order.
    fn next_active_original_streams(
        &self,
        after: Option<&StreamHandle>,
        limit: usize,
    ) -> Vec<(StreamHandle, OriginalStreamData)>;

    /// Next batch of metastream entries strictly after `after`.
    fn next_metastreams(
        &self,
        after: Option<&StreamHandle>,
        limit: usize,
    ) -> Vec<(StreamHandle, MetastreamData)>;

    fn time_range(&self, logical_chunk: i64) -> Option<ChunkTimeRange>;

    /// Store the calculated pair for a stream. Discard points never move
    /// backwards; the monotonic guard is enforced here.
    fn set_original_stream_calculation(
        &mut self,
        handle: &StreamHandle,
        status: StreamStatus,
        discard_point: DiscardPoint,
        maybe_discard_point: DiscardPoint,
    ) -> Result<(), Error>;

    fn add_chunk_weight(&mut self, logical_chunk: i64, weight: f32);
}

impl StateForCalculator for StateTransaction<'_> {
    fn next_active_original_streams(
        &self,
        after: Option<&StreamHandle>,
        limit: usize,
    ) -> Vec<(StreamHandle, OriginalStreamData)> {
        let hash_of = self.state.hash_of();
        let mut after = after.cloned();
        let mut out = Vec::new();
        // skip over non-active entries without giving up the bound
        while out.len() < limit {
            let batch = self
                .state
                .data
                .original_streams
                .collect_after(after.as_ref(), limit, &hash_of);
            let Some((last, _)) = batch.last() else {
                break;
            };
            after = Some(last.clone());
            for (handle, data) in batch {
                if data.status == StreamStatus::Active && out.len() < limit {
                    out.push((handle, data));
                }
            }
        }
        out
    }

    fn next_metastreams(
        &self,
        after: Option<&StreamHandle>,
        limit: usize,
    ) -> Vec<(StreamHandle, MetastreamData)> {
        let hash_of = self.state.hash_of();
        self.state
            .data
            .metastreams
            .collect_after(after, limit, &hash_of)
    }

    fn time_range(&self, logical_chunk: i64) -> Option<ChunkTimeRange> {
        self.state.chunk_time_range(logical_chunk)
    }

    fn set_original_stream_calculation(
        &mut self,
        handle: &StreamHandle,
        status: StreamStatus,
        discard_point: DiscardPoint,
        maybe_discard_point: DiscardPoint,
    ) -> Result<(), Error> {
        let entry = self
            .state
            .data
            .original_streams
            .get_mut(handle)
            .ok_or_else(|| super::error::ScavengeError::UnresolvableHandle(handle.clone()))?;
        entry.status = status;
        entry.discard_point = entry.discard_point.or(discard_point);
        entry.maybe_discard_point = entry
            .maybe_discard_point
            .or(maybe_discard_point)
            .or(entry.discard_point);
        Ok(())
    }

    fn add_chunk_weight(&mut self, logical_chunk: i64, weight: f32) {
        *self
            .state
            .data
            .chunk_weights
            .entry(logical_chunk)
            .or_insert(0.0) += weight;
    }
}

/// Read-only state surface of the chunk executor.
pub trait StateForChunkExecutor {
    /// Summed weight of a physical chunk's logical range (inclusive).
    fn sum_chunk_weights(&self, start: i64, end: i64) -> f32;

    fn original_exec_info(&self, stream_id: &str) -> Option<OriginalExecInfo>;

    fn metastream_exec_info(&self, metastream_id: &str) -> Option<MetastreamExecInfo>;
}

impl StateForChunkExecutor for ScavengeState {
    fn sum_chunk_weights(&self, start: i64, end: i64) -> f32 {
        self.data
            .chunk_weights
            .range(start..=end)
            .map(|(_, weight)| *weight)
            .sum()
    }

    fn original_exec_info(&self, stream_id: &str) -> Option<OriginalExecInfo> {
        let handle = self.resolve_handle(stream_id);
        self.data
            .original_streams
            .get(&handle)
            .map(|data| OriginalExecInfo {
                is_tombstoned: data.is_tombstoned,
                discard_point: data.discard_point,
                maybe_discard_point: data.maybe_discard_point,
                max_age: data.metadata.max_age,
            })
    }

    fn metastream_exec_info(&self, metastream_id: &str) -> Option<MetastreamExecInfo> {
        let handle = self.resolve_handle(metastream_id);
        self.data
            .metastreams
            .get(&handle)
            .map(|data| MetastreamExecInfo {
                is_tombstoned: data.is_tombstoned,
                discard_point: data.discard_point,
            })
    }
}

/// Read-only state surface of the index executor.
pub trait StateForIndexExecutor {
    /// Whether entries with this hash need name resolution.
    fn is_colliding_hash(&self, hash: u64) -> bool;

    fn index_exec_info_by_hash(&self, hash: u64) -> Option<IndexExecInfo>;

    fn index_exec_info_by_name(&self, stream_id: &str) -> Option<IndexExecInfo>;

    fn time_range(&self, logical_chunk: i64) -> Option<ChunkTimeRange>;
}

impl StateForIndexExecutor for ScavengeState {
    fn is_colliding_hash(&self, hash: u64) -> bool {
        self.colliding_hashes.contains(&hash)
    }

    fn index_exec_info_by_hash(&self, hash: u64) -> Option<IndexExecInfo> {
        if let Some(data) = self.data.metastreams.get_by_hash(hash) {
            return Some(IndexExecInfo::Metastream(MetastreamExecInfo {
                is_tombstoned: data.is_tombstoned,
                discard_point: data.discard_point,
            }));
        }
        self.data
            .original_streams
            .get_by_hash(hash)
            .map(|data| {
                IndexExecInfo::Original(OriginalExecInfo {
                    is_tombstoned: data.is_tombstoned,
                    discard_point: data.discard_point,
                    maybe_discard_point: data.maybe_discard_point,
                    max_age: data.metadata.max_age,
                })
            })
    }

    fn index_exec_info_by_name(&self, stream_id: &str) -> Option<IndexExecInfo> {
        if let Some(data) = self.data.metastreams.get_by_id(stream_id) {
            return Some(IndexExecInfo::Metastream(MetastreamExecInfo {
                is_tombstoned: data.is_tombstoned,
                discard_point: data.discard_point,
            }));
        }
        self.data
            .original_streams
            .get_by_id(stream_id)
            .map(|data| {
                IndexExecInfo::Original(OriginalExecInfo {
                    is_tombstoned: data.is_tombstoned,
                    discard_point: data.discard_point,
                    maybe_discard_point: data.maybe_discard_point,
                    max_age: data.metadata.max_age,
                })
            })
    }

    fn time_range(&self, logical_chunk: i64) -> Option<ChunkTimeRange> {
        self.chunk_time_range(logical_chunk)
    }
}

/// State surface of the cleaner.
pub trait StateForCleaner {
    fn original_streams_snapshot(&self) -> Vec<(StreamHandle, StreamStatus)>;

    /// Statuses of all original streams tracked under this hash (one on
    /// the hash side, or several colliding ones on the id side).
    fn statuses_for_hash(&self, hash: u64) -> Vec<StreamStatus>;

    /// All metastream entries with the hash of their underlying stream.
    fn metastreams_snapshot(&self) -> Vec<(StreamHandle, u64)>;

    fn remove_original_stream(&mut self, handle: &StreamHandle);

    fn remove_metastream(&mut self, handle: &StreamHandle);
}

impl StateForCleaner for StateTransaction<'_> {
    fn original_streams_snapshot(&self) -> Vec<(StreamHandle, StreamStatus)> {
        let hash_of = self.state.hash_of();
        self.state
            .data
            .original_streams
            .iter(&hash_of)
            .map(|(handle, data)| (handle, data.status))
            .collect()
    }

    fn statuses_for_hash(&self, hash: u64) -> Vec<StreamStatus> {
        let mut statuses = Vec::new();
        if let Some(data) = self.state.data.original_streams.get_by_hash(hash) {
            statuses.push(data.status);
        }
        if self.state.colliding_hashes.contains(&hash) {
            for (id, data) in self.state.data.original_streams.iter_by_id() {
                if self.state.hasher.hash(id) == hash {
                    statuses.push(data.status);
                }
            }
        }
        statuses
    }

    fn metastreams_snapshot(&self) -> Vec<(StreamHandle, u64)> {
        let hash_of = self.state.hash_of();
        self.state
            .data
            .metastreams
            .iter(&hash_of)
            .map(|(handle, data)| (handle, data.original_stream_hash))
            .collect()
    }

    fn remove_original_stream(&mut self, handle: &StreamHandle) {
        self.state.data.original_streams.remove(handle);
    }

    fn remove_metastream(&mut self, handle: &StreamHandle) {
        self.state.data.metastreams.remove(handle);
    }
}
