use std::sync::{Arc, Mutex, PoisonError};

use crate::common::WindowResultBuffer;

use super::runtime_context::EmitFn;

// Collects emitted window results in arrival order
#[derive(Clone, Default)]
pub struct ResultCollector {
    results: Arc<Mutex<Vec<WindowResultBuffer>>>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitter(&self) -> EmitFn {
        let results = Arc::clone(&self.results);
        Arc::new(move |buffer: WindowResultBuffer| {
            results
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(buffer)
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn results(&self) -> Vec<WindowResultBuffer> {
        self.lock().clone()
    }

    /// Results ordered by output sequence number.
    pub fn sorted_by_sequence(&self) -> Vec<WindowResultBuffer> {
        let mut results = self.results();
        results.sort_by_key(WindowResultBuffer::sequence_number);
        results
    }

    pub fn take(&self) -> Vec<WindowResultBuffer> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WindowResultBuffer>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
