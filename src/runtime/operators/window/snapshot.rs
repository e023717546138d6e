use serde::{Deserialize, Serialize};

use crate::common::{SequenceNumber, SliceIndex, Timestamp};
use crate::runtime::watermark::WatermarkSnapshot;

use super::error::{WindowError, WindowResult};
use super::slice::SliceState;

/// One open slice with its partials combined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceSnapshot {
    pub index: SliceIndex,
    pub records: u64,
    pub state: SliceState,
}

/// Resumable state of a window operator handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerSnapshot {
    pub slices: Vec<SliceSnapshot>,
    pub first_index: SliceIndex,
    pub trigger_frontier: Timestamp,
    pub next_sequence_number: SequenceNumber,
    pub build_watermarks: WatermarkSnapshot,
    pub probe_watermarks: WatermarkSnapshot,
}

impl HandlerSnapshot {
    pub fn encode(&self) -> WindowResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| WindowError::Snapshot(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> WindowResult<Self> {
        bincode::deserialize(bytes).map_err(|e| WindowError::Snapshot(e.to_string()))
    }
}
