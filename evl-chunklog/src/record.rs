use bitflags::bitflags;

bitflags! {
    /// Flags carried by a prepare record.
    pub struct PrepareFlags: u16 {
        /// The prepare is its own commit (single record transaction).
        const SELF_COMMITTED = 0x0001;
        /// Terminal delete event for the stream.
        const TOMBSTONE = 0x0002;
    }
}

impl Default for PrepareFlags {
    fn default() -> Self {
        PrepareFlags::SELF_COMMITTED
    }
}

/// A user event as stored in the transaction file.
///
/// Prepare records are immutable on disk. The struct doubles as a
/// reusable read buffer, so chunk readers fill it in place instead of
/// allocating one per record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrepareRecord {
    pub log_position: i64,
    pub stream_id: String,
    pub event_number: i64,
    pub timestamp: i64,
    pub flags: PrepareFlags,
    pub payload: Vec<u8>,
}

impl PrepareRecord {
    pub fn is_self_committed(&self) -> bool {
        self.flags.contains(PrepareFlags::SELF_COMMITTED)
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags.contains(PrepareFlags::TOMBSTONE)
    }

    /// Reset the buffer before the next fill.
    pub fn clear(&mut self) {
        self.log_position = 0;
        self.stream_id.clear();
        self.event_number = 0;
        self.timestamp = 0;
        self.flags = PrepareFlags::default();
        self.payload.clear();
    }
}

/// A system record (epoch markers, checksums and friends). Opaque to the
/// scavenger, always copied verbatim on chunk rewrite.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemRecord {
    pub log_position: i64,
    pub timestamp: i64,
    pub payload: Vec<u8>,
}

impl SystemRecord {
    pub fn clear(&mut self) {
        self.log_position = 0;
        self.timestamp = 0;
        self.payload.clear();
    }
}

/// Which of the two read buffers the last [`ChunkReader::next_record`]
/// call filled.
///
/// [`ChunkReader::next_record`]: crate::ChunkReader::next_record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Prepare,
    System,
}
