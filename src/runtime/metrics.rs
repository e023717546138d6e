use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::common::{SliceIndex, Timestamp};

// Window operator metrics
pub const METRIC_WINDOW_RECORDS_PROCESSED: &str = "volga_window_records_processed";
pub const METRIC_WINDOW_LATE_RECORDS_DROPPED: &str = "volga_window_late_records_dropped";
pub const METRIC_WINDOW_UNTIMED_RECORDS_DROPPED: &str = "volga_window_untimed_records_dropped";
pub const METRIC_WINDOW_WINDOWS_EMITTED: &str = "volga_window_windows_emitted";
pub const METRIC_WINDOW_RESULT_ROWS: &str = "volga_window_result_rows";
pub const METRIC_WINDOW_SLICES_CREATED: &str = "volga_window_slices_created";
pub const METRIC_WINDOW_SLICES_COLLECTED: &str = "volga_window_slices_collected";
pub const METRIC_WINDOW_LIVE_SLICES: &str = "volga_window_live_slices";
pub const METRIC_WINDOW_BUILD_WATERMARK: &str = "volga_window_build_watermark";
pub const METRIC_WINDOW_PROBE_WATERMARK: &str = "volga_window_probe_watermark";

// Label constants
pub const LABEL_OPERATOR_ID: &str = "operator_id";

/// Point-in-time copy of [`WindowOperatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowOperatorMetrics {
    pub records_processed: u64,
    pub late_records_dropped: u64,
    pub untimed_records_dropped: u64,
    pub windows_emitted: u64,
    pub result_rows: u64,
    pub slices_created: u64,
    pub slices_collected: u64,
}

impl WindowOperatorMetrics {
    pub fn merge(stats: Vec<&WindowOperatorMetrics>) -> Self {
        stats.into_iter().fold(Self::default(), |acc, s| Self {
            records_processed: acc.records_processed + s.records_processed,
            late_records_dropped: acc.late_records_dropped + s.late_records_dropped,
            untimed_records_dropped: acc.untimed_records_dropped + s.untimed_records_dropped,
            windows_emitted: acc.windows_emitted + s.windows_emitted,
            result_rows: acc.result_rows + s.result_rows,
            slices_created: acc.slices_created + s.slices_created,
            slices_collected: acc.slices_collected + s.slices_collected,
        })
    }
}

/// Counters of one window operator. Every update is mirrored to the `metrics` facade,
/// which is a no-op unless a recorder is installed.
#[derive(Debug)]
pub struct WindowOperatorStats {
    operator_id: String,
    records_processed: AtomicU64,
    late_records_dropped: AtomicU64,
    untimed_records_dropped: AtomicU64,
    windows_emitted: AtomicU64,
    result_rows: AtomicU64,
    slices_created: AtomicU64,
    slices_collected: AtomicU64,
}

impl WindowOperatorStats {
    pub fn new(operator_id: String) -> Self {
        Self {
            operator_id,
            records_processed: AtomicU64::new(0),
            late_records_dropped: AtomicU64::new(0),
            untimed_records_dropped: AtomicU64::new(0),
            windows_emitted: AtomicU64::new(0),
            result_rows: AtomicU64::new(0),
            slices_created: AtomicU64::new(0),
            slices_collected: AtomicU64::new(0),
        }
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn record_processed(&self, records: u64) {
        if records == 0 {
            return;
        }
        self.records_processed.fetch_add(records, Ordering::Relaxed);
        counter!(METRIC_WINDOW_RECORDS_PROCESSED, LABEL_OPERATOR_ID => self.operator_id.clone()).increment(records);
    }

    /// Counts dropped records; logs when the total crosses a power of two.
    pub fn record_late_dropped(&self, records: u64, first_index: SliceIndex) {
        if records == 0 {
            return;
        }
        let before = self.late_records_dropped.fetch_add(records, Ordering::Relaxed);
        let after = before + records;
        counter!(METRIC_WINDOW_LATE_RECORDS_DROPPED, LABEL_OPERATOR_ID => self.operator_id.clone()).increment(records);
        if before.leading_zeros() != after.leading_zeros() {
            warn!(
                "Operator {} dropped {} late records so far (first retained slice {})",
                self.operator_id, after, first_index
            );
        }
    }

    /// Counts rows dropped for a null event time.
    pub fn record_untimed_dropped(&self, records: u64) {
        if records == 0 {
            return;
        }
        self.untimed_records_dropped.fetch_add(records, Ordering::Relaxed);
        counter!(METRIC_WINDOW_UNTIMED_RECORDS_DROPPED, LABEL_OPERATOR_ID => self.operator_id.clone()).increment(records);
    }

    pub fn record_window_emitted(&self, rows: usize) {
        self.windows_emitted.fetch_add(1, Ordering::Relaxed);
        self.result_rows.fetch_add(rows as u64, Ordering::Relaxed);
        counter!(METRIC_WINDOW_WINDOWS_EMITTED, LABEL_OPERATOR_ID => self.operator_id.clone()).increment(1);
        counter!(METRIC_WINDOW_RESULT_ROWS, LABEL_OPERATOR_ID => self.operator_id.clone()).increment(rows as u64);
    }

    /// Publishes slice store totals; counters only grow by the delta since the last call.
    pub fn record_slices(&self, created_total: u64, collected_total: u64, live: usize) {
        let created = created_total.saturating_sub(self.slices_created.swap(created_total, Ordering::Relaxed));
        let collected =
            collected_total.saturating_sub(self.slices_collected.swap(collected_total, Ordering::Relaxed));
        if created > 0 {
            counter!(METRIC_WINDOW_SLICES_CREATED, LABEL_OPERATOR_ID => self.operator_id.clone()).increment(created);
        }
        if collected > 0 {
            counter!(METRIC_WINDOW_SLICES_COLLECTED, LABEL_OPERATOR_ID => self.operator_id.clone()).increment(collected);
        }
        gauge!(METRIC_WINDOW_LIVE_SLICES, LABEL_OPERATOR_ID => self.operator_id.clone()).set(live as f64);
    }

    pub fn record_watermarks(&self, build: Timestamp, probe: Timestamp) {
        gauge!(METRIC_WINDOW_BUILD_WATERMARK, LABEL_OPERATOR_ID => self.operator_id.clone()).set(build as f64);
        gauge!(METRIC_WINDOW_PROBE_WATERMARK, LABEL_OPERATOR_ID => self.operator_id.clone()).set(probe as f64);
    }

    pub fn snapshot(&self) -> WindowOperatorMetrics {
        WindowOperatorMetrics {
            records_processed: self.records_processed.load(Ordering::Relaxed),
            late_records_dropped: self.late_records_dropped.load(Ordering::Relaxed),
            untimed_records_dropped: self.untimed_records_dropped.load(Ordering::Relaxed),
            windows_emitted: self.windows_emitted.load(Ordering::Relaxed),
            result_rows: self.result_rows.load(Ordering::Relaxed),
            slices_created: self.slices_created.load(Ordering::Relaxed),
            slices_collected: self.slices_collected.load(Ordering::Relaxed),
        }
    }
}
