use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info};

use crate::common::RecordBuffer;

use super::metrics::WindowOperatorMetrics;
use super::operators::window::{TerminationType, WindowError, WindowOperatorHandler};
use super::runtime_context::PipelineContext;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Requests a running pipeline to stop between buffers.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Drives one window operator with a pool of worker threads.
///
/// Every worker pulls buffers from the shared input channel and hands them to the
/// handler. When the channel disconnects or a stop is requested, the remaining windows
/// are flushed on the calling thread and the handler is stopped gracefully. The first
/// worker error stops every worker and the handler with [`TerminationType::Failure`].
pub struct WindowPipeline {
    handler: Arc<WindowOperatorHandler>,
    ctx: PipelineContext,
    thread_pool: ThreadPool,
    stop_handle: StopHandle,
    poll_interval: Duration,
}

impl WindowPipeline {
    pub fn new(handler: Arc<WindowOperatorHandler>, ctx: PipelineContext) -> Result<Self> {
        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(ctx.num_worker_threads())
            .thread_name(|i| format!("window-worker-{}", i))
            .build()
            .context("Failed to create window worker pool")?;
        Ok(Self {
            handler,
            ctx,
            thread_pool,
            stop_handle: StopHandle::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// How long an idle worker waits for input before checking for a stop request.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn handler(&self) -> &Arc<WindowOperatorHandler> {
        &self.handler
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Runs the operator until the input disconnects or a stop is requested.
    pub fn run(&self, input: Receiver<RecordBuffer>) -> Result<WindowOperatorMetrics> {
        self.handler
            .setup(&self.ctx, self.handler.accumulator_entry_size())?;
        self.handler.start(&self.ctx)?;

        let first_error: Mutex<Option<WindowError>> = Mutex::new(None);
        let failed = AtomicBool::new(false);

        let processed = self.thread_pool.broadcast(|worker_ctx| {
            let worker = worker_ctx.index();
            let mut buffers = 0usize;
            loop {
                if self.stop_handle.is_stopped() || failed.load(Ordering::SeqCst) {
                    break;
                }
                let buffer = match input.recv_timeout(self.poll_interval) {
                    Ok(buffer) => buffer,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                if let Err(e) = self.handler.process_buffer(worker, &buffer) {
                    error!("Worker {} of {} failed: {}", worker, self.ctx.operator_label(), e);
                    failed.store(true, Ordering::SeqCst);
                    first_error
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(e);
                    break;
                }
                buffers += 1;
            }
            debug!("Worker {} finished after {} buffers", worker, buffers);
            buffers
        });

        if let Some(e) = first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            self.handler.stop(TerminationType::Failure, &self.ctx)?;
            return Err(e.into());
        }

        if let Err(e) = self.handler.trigger_all_windows() {
            error!("Failed to flush windows of {}: {}", self.ctx.operator_label(), e);
            self.handler.stop(TerminationType::Failure, &self.ctx)?;
            return Err(e.into());
        }
        self.handler.stop(TerminationType::Graceful, &self.ctx)?;

        let metrics = self.handler.metrics();
        info!(
            "Pipeline {} processed {} buffers, emitted {} windows",
            self.ctx.operator_label(),
            processed.iter().sum::<usize>(),
            metrics.windows_emitted
        );
        Ok(metrics)
    }
}
