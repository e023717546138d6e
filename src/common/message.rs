use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

pub type Timestamp = u64;
pub type OriginId = u64;
pub type SequenceNumber = u64;
pub type ChunkNumber = u64;
pub type WorkerThreadId = usize;
pub type SliceIndex = u64;

pub const MAX_WATERMARK_VALUE: Timestamp = u64::MAX;
pub const INITIAL_SEQUENCE_NUMBER: SequenceNumber = 1;
pub const INITIAL_CHUNK_NUMBER: ChunkNumber = 1;

/// Position of a buffer in its origin's stream. A sequence number may be split into
/// several chunks; only the last one carries `last_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceData {
    pub sequence_number: SequenceNumber,
    pub chunk_number: ChunkNumber,
    pub last_chunk: bool,
}

impl SequenceData {
    pub fn new(sequence_number: SequenceNumber, chunk_number: ChunkNumber, last_chunk: bool) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }

    /// Unchunked buffer.
    pub fn single(sequence_number: SequenceNumber) -> Self {
        Self::new(sequence_number, INITIAL_CHUNK_NUMBER, true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferMetadata {
    pub origin_id: OriginId,
    pub sequence: SequenceData,
    pub watermark: Timestamp,
}

impl BufferMetadata {
    pub fn new(origin_id: OriginId, sequence: SequenceData, watermark: Timestamp) -> Self {
        Self {
            origin_id,
            sequence,
            watermark,
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence.sequence_number
    }
}

/// Input buffer handed to a window pipeline by an upstream stage.
#[derive(Debug, Clone)]
pub struct RecordBuffer {
    pub metadata: BufferMetadata,
    pub record_batch: RecordBatch,
}

impl RecordBuffer {
    pub fn new(metadata: BufferMetadata, record_batch: RecordBatch) -> Self {
        Self {
            metadata,
            record_batch,
        }
    }

    pub fn num_records(&self) -> usize {
        self.record_batch.num_rows()
    }

    pub fn origin_id(&self) -> OriginId {
        self.metadata.origin_id
    }

    pub fn watermark(&self) -> Timestamp {
        self.metadata.watermark
    }
}

/// One emitted window. `metadata` carries the operator's output origin and the
/// window's output sequence number; its watermark is the window end.
#[derive(Debug, Clone)]
pub struct WindowResultBuffer {
    pub metadata: BufferMetadata,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub record_batch: RecordBatch,
}

impl WindowResultBuffer {
    pub fn new(
        metadata: BufferMetadata,
        window_start: Timestamp,
        window_end: Timestamp,
        record_batch: RecordBatch,
    ) -> Self {
        Self {
            metadata,
            window_start,
            window_end,
            record_batch,
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.metadata.sequence.sequence_number
    }

    pub fn num_records(&self) -> usize {
        self.record_batch.num_rows()
    }
}
