pub mod aggregates;
pub mod build;
pub mod error;
pub mod handler;
pub mod slice;
pub mod slice_assigner;
pub mod slice_store;
pub mod snapshot;
pub mod trigger;
pub mod window_config;


pub use aggregates::{
    AccumulatorLayout, AggregationFunction, AggregationSpec, LoweredValue, UserDefinedAggregation,
};
pub use build::{BuildOutcome, SliceBuilder};
pub use error::{WindowError, WindowResult};
pub use handler::{HandlerStatus, TerminationType, WindowOperatorHandler};
pub use slice::{Slice, SliceState};
pub use slice_assigner::SliceAssigner;
pub use slice_store::{PlannedWindow, SliceStore, SliceStoreOptions};
pub use snapshot::{HandlerSnapshot, SliceSnapshot};
pub use trigger::{SliceMergeTask, WindowMerger};
pub use window_config::{WindowOperatorConfig, WindowType, WINDOW_END_FIELD, WINDOW_START_FIELD};
