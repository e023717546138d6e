use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::common::WindowResultBuffer;

/// Downstream emit callback of a pipeline.
pub type EmitFn = Arc<dyn Fn(WindowResultBuffer) + Send + Sync>;

#[derive(Clone)]
pub struct PipelineContext {
    pipeline_id: u64,
    operator_id: u64,
    operator_name: String,
    num_worker_threads: usize,
    emitter: EmitFn,
    job_config: HashMap<String, Value>,
}

impl PipelineContext {
    pub fn new(
        pipeline_id: u64,
        operator_id: u64,
        operator_name: String,
        num_worker_threads: usize,
        emitter: EmitFn,
        job_config: Option<HashMap<String, Value>>,
    ) -> Self {
        Self {
            pipeline_id,
            operator_id,
            operator_name,
            num_worker_threads: num_worker_threads.max(1),
            emitter,
            job_config: job_config.unwrap_or_default(),
        }
    }

    pub fn pipeline_id(&self) -> u64 { self.pipeline_id }
    pub fn operator_id(&self) -> u64 { self.operator_id }
    pub fn operator_name(&self) -> &str { &self.operator_name }
    pub fn num_worker_threads(&self) -> usize { self.num_worker_threads }
    pub fn job_config(&self) -> &HashMap<String, Value> { &self.job_config }

    pub fn emitter(&self) -> EmitFn {
        Arc::clone(&self.emitter)
    }

    pub fn emit(&self, buffer: WindowResultBuffer) {
        (self.emitter)(buffer)
    }

    /// Label used for metrics and logs.
    pub fn operator_label(&self) -> String {
        format!("{}_{}_{}", self.operator_name, self.operator_id, self.pipeline_id)
    }
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("pipeline_id", &self.pipeline_id)
            .field("operator_id", &self.operator_id)
            .field("operator_name", &self.operator_name)
            .field("num_worker_threads", &self.num_worker_threads)
            .field("job_config", &self.job_config)
            .finish_non_exhaustive()
    }
}
