pub mod collector;
pub mod metrics;
pub mod operators;
pub mod pipeline;
pub mod runtime_context;
pub mod watermark;
