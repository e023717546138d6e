//! Error types for the window slicing runtime.

use crate::common::{OriginId, SliceIndex, Timestamp};

use super::handler::HandlerStatus;

/// Errors raised by slices, slice stores, watermark processors and the window handler.
///
/// Only [`WindowError::LateDataDropped`] is recoverable; the build path counts it and moves
/// on. Every other variant fails the enclosing query.
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    /// Event time maps to a slice that was already collected or whose windows were all emitted.
    #[error("late data dropped: timestamp {timestamp} maps to slice {index}, first retained slice is {first_index}")]
    LateDataDropped {
        /// Event timestamp of the record.
        timestamp: Timestamp,
        /// Slice index the timestamp maps to.
        index: SliceIndex,
        /// Lowest slice index still retained by the store.
        first_index: SliceIndex,
    },

    /// An origin reported a watermark lower than the one previously recorded for it.
    #[error("watermark regression from origin {origin_id}: received {received}, previous {previous}")]
    WatermarkRegression {
        /// Reporting origin.
        origin_id: OriginId,
        /// Watermark already recorded for the origin.
        previous: Timestamp,
        /// Regressed watermark.
        received: Timestamp,
    },

    /// A buffer arrived from an origin outside the closed input-origin set.
    #[error("buffer from unknown origin {0} after the input-origin set was closed")]
    UnknownOriginAfterClose(OriginId),

    /// The slice budget is exhausted.
    #[error("cannot allocate slice {index}: {live} live slices, limit {limit}")]
    SliceAllocationFailed {
        /// Index of the slice that could not be created.
        index: SliceIndex,
        /// Slices currently alive.
        live: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The slice was finalized; it no longer accepts writes.
    #[error("slice {0} is finalized")]
    SliceFinalized(SliceIndex),

    /// Configuration rejected at setup.
    #[error("invalid window configuration: {0}")]
    InvalidConfig(String),

    /// A lifecycle call arrived in the wrong state.
    #[error("invalid lifecycle transition: {operation} in state {status:?}")]
    InvalidLifecycle {
        /// Lifecycle call that was rejected.
        operation: &'static str,
        /// Handler state at the time of the call.
        status: HandlerStatus,
    },

    /// An input batch does not carry the configured columns.
    #[error("input batch does not match the configured schema: {0}")]
    SchemaMismatch(String),

    /// Arrow failure while reading input or building results.
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    /// Snapshot encoding or decoding failed.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl WindowError {
    /// Whether the error should terminate the query.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WindowError::LateDataDropped { .. } | WindowError::SliceFinalized(_))
    }
}

pub type WindowResult<T> = Result<T, WindowError>;
