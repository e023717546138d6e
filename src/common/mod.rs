pub mod key;
pub mod message;
pub mod test_utils;

pub use key::{Key, KeyExtractor};
pub use message::{
    BufferMetadata, RecordBuffer, SequenceData, WindowResultBuffer, ChunkNumber, OriginId,
    SequenceNumber, SliceIndex, Timestamp, WorkerThreadId, INITIAL_CHUNK_NUMBER,
    INITIAL_SEQUENCE_NUMBER, MAX_WATERMARK_VALUE,
};
