pub mod common;
pub mod runtime;

pub use common::{BufferMetadata, Key, RecordBuffer, SequenceData, WindowResultBuffer};
pub use runtime::operators::window::{
    AggregationFunction, AggregationSpec, HandlerStatus, TerminationType, WindowError,
    WindowOperatorConfig, WindowOperatorHandler, WindowType,
};
pub use runtime::pipeline::{StopHandle, WindowPipeline};
pub use runtime::runtime_context::PipelineContext;
