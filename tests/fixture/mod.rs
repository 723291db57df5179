//! In-memory transaction file for scavenge tests.
//!
//! The log is a vector of records at fixed 128 byte slots; every port
//! the scavenger consumes is implemented on top of one shared
//! `LogInner`, so chunk rewrites are observable through the same handle
//! the test built the log with.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use evl_api_types::{ScavengeStatus, ScavengeTuning};
use evl_chunklog::{
    ChunkManager, ChunkReader, ChunkWriter, Clock, CompositeHasher, EventInfo, IndexEntry,
    IndexReader, IndexScavengeStats, IndexWriter, PrepareFlags, PrepareRecord, RecordKind,
    ScavengePoint, ScavengePointSource, StandardMetastreams, StreamHandle, StreamHasher,
    StreamMetadata, SystemRecord, SCAVENGES_STREAM,
};
use evl_tools::task::WorkerTaskContext;
use evlog::scavenge::runner::ScavengeParams;
use evlog::scavenge::state::ScavengeState;
use evlog::scavenge::ScavengeError;
use evlog::Scavenger;

pub const CHUNK_SIZE: i64 = 4096;
pub const RECORD_SIZE: i64 = 128;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Prepare(PrepareRecord),
    System(SystemRecord),
}

impl Record {
    pub fn log_position(&self) -> i64 {
        match self {
            Record::Prepare(prepare) => prepare.log_position,
            Record::System(system) => system.log_position,
        }
    }

    pub fn as_prepare(&self) -> Option<&PrepareRecord> {
        match self {
            Record::Prepare(prepare) => Some(prepare),
            Record::System(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ScavengePointPayload {
    #[serde(rename = "effectiveNow")]
    effective_now: i64,
    threshold: i64,
}

struct LogInner {
    chunk_size: i64,
    head: i64,
    next_event_numbers: HashMap<String, i64>,
    records: Vec<Record>,
    index: Vec<IndexEntry>,
    kept_temp_files: usize,
    deleted_temp_files: usize,
    reader_opens: usize,
    fail_nth_reader: Option<usize>,
}

impl LogInner {
    fn stream_name_at(&self, log_position: i64) -> Result<String, Error> {
        self.records
            .iter()
            .filter_map(Record::as_prepare)
            .find(|prepare| prepare.log_position == log_position)
            .map(|prepare| prepare.stream_id.clone())
            .ok_or_else(|| format_err!("no prepare at position {log_position}"))
    }

    fn entries_for_handle(&self, handle: &StreamHandle, sp: &ScavengePoint) -> Vec<IndexEntry> {
        let mut entries: Vec<IndexEntry> = self
            .index
            .iter()
            .filter(|entry| entry.stream_hash == handle.hash())
            .filter(|entry| entry.log_position < sp.position)
            .filter(|entry| match handle {
                StreamHandle::Hash(_) => true,
                StreamHandle::Id { id, .. } => self
                    .stream_name_at(entry.log_position)
                    .map(|name| &name == id)
                    .unwrap_or(false),
            })
            .copied()
            .collect();
        entries.sort_by_key(|entry| entry.event_number);
        entries
    }
}

#[derive(Clone)]
pub struct TestLog {
    inner: Arc<Mutex<LogInner>>,
    hasher: Arc<dyn StreamHasher + Send + Sync>,
}

impl TestLog {
    pub fn new() -> Self {
        Self::with_hasher(Arc::new(CompositeHasher))
    }

    pub fn with_hasher(hasher: Arc<dyn StreamHasher + Send + Sync>) -> Self {
        TestLog {
            inner: Arc::new(Mutex::new(LogInner {
                chunk_size: CHUNK_SIZE,
                head: 0,
                next_event_numbers: HashMap::new(),
                records: Vec::new(),
                index: Vec::new(),
                kept_temp_files: 0,
                deleted_temp_files: 0,
                reader_opens: 0,
                fail_nth_reader: None,
            })),
            hasher,
        }
    }

    fn append_prepare(
        &self,
        stream: &str,
        timestamp: i64,
        flags: PrepareFlags,
        payload: Vec<u8>,
    ) -> (i64, i64) {
        let mut inner = self.inner.lock().unwrap();
        let log_position = inner.head;
        let event_number = {
            let next = inner
                .next_event_numbers
                .entry(stream.to_string())
                .or_insert(0);
            let number = *next;
            *next += 1;
            number
        };
        inner.records.push(Record::Prepare(PrepareRecord {
            log_position,
            stream_id: stream.to_string(),
            event_number,
            timestamp,
            flags,
            payload,
        }));
        inner.index.push(IndexEntry {
            stream_hash: self.hasher.hash(stream),
            event_number,
            log_position,
        });
        inner.head += RECORD_SIZE;
        (log_position, event_number)
    }

    pub fn append_event(&self, stream: &str, timestamp: i64) -> i64 {
        self.append_prepare(stream, timestamp, PrepareFlags::SELF_COMMITTED, b"{}".to_vec())
            .0
    }

    /// A prepare that is part of an open (multi record) transaction.
    pub fn append_uncommitted_event(&self, stream: &str, timestamp: i64) -> i64 {
        self.append_prepare(stream, timestamp, PrepareFlags::empty(), b"{}".to_vec())
            .0
    }

    pub fn append_metadata(&self, stream: &str, metadata: &StreamMetadata, timestamp: i64) -> i64 {
        let metastream = StandardMetastreams.metastream_of(stream);
        let payload = serde_json::to_vec(metadata).unwrap();
        self.append_prepare(&metastream, timestamp, PrepareFlags::SELF_COMMITTED, payload)
            .0
    }

    pub fn append_tombstone(&self, stream: &str, timestamp: i64) -> i64 {
        self.append_prepare(
            stream,
            timestamp,
            PrepareFlags::SELF_COMMITTED | PrepareFlags::TOMBSTONE,
            Vec::new(),
        )
        .0
    }

    /// Only used by the metastream-tombstone failure test; real engines
    /// refuse to write these.
    pub fn append_metastream_tombstone(&self, stream: &str, timestamp: i64) -> i64 {
        let metastream = StandardMetastreams.metastream_of(stream);
        self.append_prepare(
            &metastream,
            timestamp,
            PrepareFlags::SELF_COMMITTED | PrepareFlags::TOMBSTONE,
            Vec::new(),
        )
        .0
    }

    pub fn append_scavenge_point(&self, effective_now: i64, threshold: i64) -> ScavengePoint {
        let payload = serde_json::to_vec(&ScavengePointPayload {
            effective_now,
            threshold,
        })
        .unwrap();
        let (position, event_number) = self.append_prepare(
            SCAVENGES_STREAM,
            effective_now,
            PrepareFlags::SELF_COMMITTED,
            payload,
        );
        ScavengePoint {
            position,
            event_number,
            effective_now,
            threshold,
        }
    }

    pub fn pad_to_next_chunk(&self) {
        let mut inner = self.inner.lock().unwrap();
        let chunk_size = inner.chunk_size;
        inner.head = (inner.head / chunk_size + 1) * chunk_size;
    }

    /// Make the n-th chunk reader handed out (1-based, counted from the
    /// start of the test) fail its reads as if the chunk was deleted
    /// underneath it.
    pub fn fail_nth_reader(&self, n: Option<usize>) {
        self.inner.lock().unwrap().fail_nth_reader = n;
    }

    pub fn records(&self) -> Vec<Record> {
        self.inner.lock().unwrap().records.clone()
    }

    pub fn chunk_records(&self, chunk: i64) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        let start = chunk * inner.chunk_size;
        let end = start + inner.chunk_size;
        inner
            .records
            .iter()
            .filter(|record| record.log_position() >= start && record.log_position() < end)
            .cloned()
            .collect()
    }

    /// Event numbers of a stream still present in the log, ascending.
    pub fn surviving_event_numbers(&self, stream: &str) -> Vec<i64> {
        let mut numbers: Vec<i64> = self
            .records()
            .iter()
            .filter_map(Record::as_prepare)
            .filter(|prepare| prepare.stream_id == stream)
            .map(|prepare| prepare.event_number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn index_entries(&self) -> Vec<IndexEntry> {
        self.inner.lock().unwrap().index.clone()
    }

    pub fn kept_temp_files(&self) -> usize {
        self.inner.lock().unwrap().kept_temp_files
    }

    pub fn deleted_temp_files(&self) -> usize {
        self.inner.lock().unwrap().deleted_temp_files
    }

    pub fn chunk_manager(&self) -> MemoryChunkManager {
        MemoryChunkManager {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn index_reader(&self) -> MemoryIndexReader {
        MemoryIndexReader {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn index_writer(&self) -> MemoryIndexWriter {
        MemoryIndexWriter {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn scavenge_point_source(&self) -> MemoryScavengePointSource {
        MemoryScavengePointSource {
            inner: Arc::clone(&self.inner),
            hasher: Arc::clone(&self.hasher),
        }
    }
}

impl Default for TestLog {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryChunkManager {
    inner: Arc<Mutex<LogInner>>,
}

impl ChunkManager for MemoryChunkManager {
    fn chunk_size(&self) -> i64 {
        self.inner.lock().unwrap().chunk_size
    }

    fn chunk_count(&self) -> i64 {
        let inner = self.inner.lock().unwrap();
        inner.head / inner.chunk_size + 1
    }

    fn get_chunk_reader_for(&self, log_position: i64) -> Result<Box<dyn ChunkReader>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.reader_opens += 1;
        let fail = inner.fail_nth_reader == Some(inner.reader_opens);
        let chunk = log_position / inner.chunk_size;
        let start = chunk * inner.chunk_size;
        let end = start + inner.chunk_size;
        let records: Vec<Record> = inner
            .records
            .iter()
            .filter(|record| record.log_position() >= start && record.log_position() < end)
            .cloned()
            .collect();
        Ok(Box::new(MemoryChunkReader {
            name: format!("chunk-{chunk:06}"),
            chunk,
            start,
            end,
            file_size: (records.len() as i64 * RECORD_SIZE) as u64,
            fail,
            records,
            cursor: 0,
        }))
    }

    fn create_chunk_writer(&self, source: &dyn ChunkReader) -> Result<Box<dyn ChunkWriter>, Error> {
        Ok(Box::new(MemoryChunkWriter {
            inner: Arc::clone(&self.inner),
            name: source.name().to_string(),
            start: source.chunk_start_position(),
            end: source.chunk_end_position(),
            out: Vec::new(),
            finished: false,
        }))
    }

    fn merge_chunks(&self, _worker: &dyn WorkerTaskContext) -> Result<(), Error> {
        Ok(())
    }
}

pub struct MemoryChunkReader {
    name: String,
    chunk: i64,
    start: i64,
    end: i64,
    file_size: u64,
    fail: bool,
    records: Vec<Record>,
    cursor: usize,
}

impl ChunkReader for MemoryChunkReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn chunk_start_number(&self) -> i64 {
        self.chunk
    }

    fn chunk_end_number(&self) -> i64 {
        self.chunk
    }

    fn chunk_start_position(&self) -> i64 {
        self.start
    }

    fn chunk_end_position(&self) -> i64 {
        self.end
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn next_record(
        &mut self,
        prepare: &mut PrepareRecord,
        system: &mut SystemRecord,
    ) -> Result<Option<RecordKind>, Error> {
        if self.fail {
            return Err(ScavengeError::ChunkBeingDeleted { chunk: self.chunk }.into());
        }
        let Some(record) = self.records.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        match record {
            Record::Prepare(source) => {
                prepare.clone_from(source);
                Ok(Some(RecordKind::Prepare))
            }
            Record::System(source) => {
                system.clone_from(source);
                Ok(Some(RecordKind::System))
            }
        }
    }
}

pub struct MemoryChunkWriter {
    inner: Arc<Mutex<LogInner>>,
    name: String,
    start: i64,
    end: i64,
    out: Vec<Record>,
    finished: bool,
}

impl ChunkWriter for MemoryChunkWriter {
    fn write_prepare(&mut self, record: &PrepareRecord) -> Result<(), Error> {
        self.out.push(Record::Prepare(record.clone()));
        Ok(())
    }

    fn write_system(&mut self, record: &SystemRecord) -> Result<(), Error> {
        self.out.push(Record::System(record.clone()));
        Ok(())
    }

    fn complete(&mut self) -> Result<(String, u64), Error> {
        if self.finished {
            bail!("chunk writer for {} finished twice", self.name);
        }
        self.finished = true;

        let mut inner = self.inner.lock().unwrap();
        let (start, end) = (self.start, self.end);
        inner
            .records
            .retain(|record| record.log_position() < start || record.log_position() >= end);
        inner.records.append(&mut self.out);
        inner.records.sort_by_key(Record::log_position);

        let size = inner
            .records
            .iter()
            .filter(|record| record.log_position() >= start && record.log_position() < end)
            .count() as u64
            * RECORD_SIZE as u64;
        Ok((format!("{}.scavenged", self.name), size))
    }

    fn abort(&mut self, delete_immediately: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut inner = self.inner.lock().unwrap();
        if delete_immediately {
            inner.deleted_temp_files += 1;
        } else {
            inner.kept_temp_files += 1;
        }
    }
}

pub struct MemoryIndexReader {
    inner: Arc<Mutex<LogInner>>,
}

impl IndexReader for MemoryIndexReader {
    fn last_event_number(
        &self,
        handle: &StreamHandle,
        scavenge_point: &ScavengePoint,
    ) -> Result<Option<i64>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries_for_handle(handle, scavenge_point)
            .last()
            .map(|entry| entry.event_number))
    }

    fn read_event_info_forward(
        &self,
        handle: &StreamHandle,
        from: i64,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<EventInfo>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries_for_handle(handle, scavenge_point)
            .into_iter()
            .filter(|entry| entry.event_number >= from)
            .take(max_count)
            .map(|entry| EventInfo {
                event_number: entry.event_number,
                log_position: entry.log_position,
            })
            .collect())
    }

    fn read_event_info_backward(
        &self,
        handle: &StreamHandle,
        from: i64,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<EventInfo>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries_for_handle(handle, scavenge_point)
            .into_iter()
            .rev()
            .filter(|entry| entry.event_number <= from)
            .take(max_count)
            .map(|entry| EventInfo {
                event_number: entry.event_number,
                log_position: entry.log_position,
            })
            .collect())
    }

    fn stream_name_at(&self, log_position: i64) -> Result<String, Error> {
        self.inner.lock().unwrap().stream_name_at(log_position)
    }
}

pub struct MemoryIndexWriter {
    inner: Arc<Mutex<LogInner>>,
}

impl IndexWriter for MemoryIndexWriter {
    fn scavenge(
        &mut self,
        should_keep: &mut dyn FnMut(&IndexEntry) -> Result<bool, Error>,
        _threads: usize,
        worker: &dyn WorkerTaskContext,
    ) -> Result<IndexScavengeStats, Error> {
        let entries = self.inner.lock().unwrap().index.clone();

        let mut kept = Vec::new();
        let mut stats = IndexScavengeStats::default();
        for entry in entries {
            worker.check_abort()?;
            if should_keep(&entry)? {
                stats.entries_kept += 1;
                kept.push(entry);
            } else {
                stats.entries_dropped += 1;
            }
        }

        self.inner.lock().unwrap().index = kept;
        Ok(stats)
    }

    fn save_to_file(&mut self, _worker: &dyn WorkerTaskContext) -> Result<(), Error> {
        Ok(())
    }
}

pub struct MemoryScavengePointSource {
    inner: Arc<Mutex<LogInner>>,
    hasher: Arc<dyn StreamHasher + Send + Sync>,
}

impl ScavengePointSource for MemoryScavengePointSource {
    fn latest(&self) -> Result<Option<ScavengePoint>, Error> {
        let inner = self.inner.lock().unwrap();
        let latest = inner
            .records
            .iter()
            .filter_map(Record::as_prepare)
            .filter(|prepare| prepare.stream_id == SCAVENGES_STREAM)
            .max_by_key(|prepare| prepare.event_number);
        let Some(prepare) = latest else {
            return Ok(None);
        };
        let payload: ScavengePointPayload = serde_json::from_slice(&prepare.payload)?;
        Ok(Some(ScavengePoint {
            position: prepare.log_position,
            event_number: prepare.event_number,
            effective_now: payload.effective_now,
            threshold: payload.threshold,
        }))
    }

    fn append(&mut self, effective_now: i64, threshold: i64) -> Result<ScavengePoint, Error> {
        let mut inner = self.inner.lock().unwrap();
        let log_position = inner.head;
        let event_number = {
            let next = inner
                .next_event_numbers
                .entry(SCAVENGES_STREAM.to_string())
                .or_insert(0);
            let number = *next;
            *next += 1;
            number
        };
        let payload = serde_json::to_vec(&ScavengePointPayload {
            effective_now,
            threshold,
        })?;
        inner.records.push(Record::Prepare(PrepareRecord {
            log_position,
            stream_id: SCAVENGES_STREAM.to_string(),
            event_number,
            timestamp: effective_now,
            flags: PrepareFlags::SELF_COMMITTED,
            payload,
        }));
        inner.index.push(IndexEntry {
            stream_hash: self.hasher.hash(SCAVENGES_STREAM),
            event_number,
            log_position,
        });
        inner.head += RECORD_SIZE;
        Ok(ScavengePoint {
            position: log_position,
            event_number,
            effective_now,
            threshold,
        })
    }
}

pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0
    }
}

/// Worker context for tests: log lines go to stdout, and cancellation
/// can be armed to fire after a given number of abort polls.
pub struct TestWorker {
    abort: AtomicBool,
    abort_after_checks: Option<usize>,
    checks: AtomicUsize,
}

impl TestWorker {
    pub fn new() -> Self {
        TestWorker {
            abort: AtomicBool::new(false),
            abort_after_checks: None,
            checks: AtomicUsize::new(0),
        }
    }

    pub fn abort_after_checks(n: usize) -> Self {
        TestWorker {
            abort: AtomicBool::new(false),
            abort_after_checks: Some(n),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn abort_fired(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

impl Default for TestWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerTaskContext for TestWorker {
    fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn check_abort(&self) -> Result<(), Error> {
        if let Some(limit) = self.abort_after_checks {
            if self.checks.fetch_add(1, Ordering::SeqCst) + 1 > limit {
                self.abort.store(true, Ordering::SeqCst);
            }
        }
        if self.abort_requested() {
            return Err(ScavengeError::Cancelled.into());
        }
        Ok(())
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        println!("[{level}] {message}");
    }
}

/// One scavenging node: a test log plus a state file, with the ports
/// wired the way the runner would.
pub struct Harness {
    pub log: TestLog,
    pub tuning: ScavengeTuning,
    pub clock_now: i64,
    hasher: Arc<dyn StreamHasher + Send + Sync>,
    state_path: PathBuf,
}

impl Harness {
    pub fn new(name: &str) -> Self {
        Self::with_hasher(name, Arc::new(CompositeHasher))
    }

    pub fn with_hasher(name: &str, hasher: Arc<dyn StreamHasher + Send + Sync>) -> Self {
        let mut state_path = std::env::temp_dir();
        state_path.push(format!(
            "evlog-scavenge-test-{name}-{}.state",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&state_path);
        let mut lock_path = state_path.clone();
        lock_path.set_extension("lck");
        let _ = std::fs::remove_file(&lock_path);

        Harness {
            log: TestLog::with_hasher(Arc::clone(&hasher)),
            tuning: ScavengeTuning::default(),
            clock_now: 1_000_000,
            hasher,
            state_path,
        }
    }

    pub fn open_state(&self) -> ScavengeState {
        ScavengeState::open(&self.state_path, Arc::clone(&self.hasher), 128).unwrap()
    }

    pub fn run(&self) -> Result<ScavengeStatus, Error> {
        self.run_with_worker(&TestWorker::new())
    }

    pub fn run_with_worker(&self, worker: &dyn WorkerTaskContext) -> Result<ScavengeStatus, Error> {
        let mut state = self.open_state();
        let chunk_manager = self.log.chunk_manager();
        let index_reader = self.log.index_reader();
        let mut index_writer = self.log.index_writer();
        let mut scavenge_points = self.log.scavenge_point_source();
        let clock = FixedClock(self.clock_now);

        let mut scavenger = Scavenger {
            state: &mut state,
            chunk_manager: &chunk_manager,
            index_reader: &index_reader,
            index_writer: &mut index_writer,
            metastreams: &StandardMetastreams,
            scavenge_points: &mut scavenge_points,
            clock: &clock,
            tuning: &self.tuning,
            params: ScavengeParams::default(),
        };
        scavenger.run(worker)
    }

    /// Every index entry must point at a surviving record with the same
    /// stream hash and event number.
    pub fn assert_index_consistent(&self) {
        let records = self.log.records();
        for entry in self.log.index_entries() {
            let record = records
                .iter()
                .filter_map(Record::as_prepare)
                .find(|prepare| prepare.log_position == entry.log_position)
                .unwrap_or_else(|| {
                    panic!(
                        "index entry {entry:?} points at a position without a surviving record"
                    )
                });
            assert_eq!(self.hasher.hash(&record.stream_id), entry.stream_hash);
            assert_eq!(record.event_number, entry.event_number);
        }
    }
}
