pub mod config;
pub mod processor;
pub mod sequence;

pub use config::{OriginPolicy, RegressionPolicy, WatermarkConfig};
pub use processor::{MultiOriginWatermarkProcessor, WatermarkSnapshot};
pub use sequence::{SequenceTracker, TrackerUpdate};
