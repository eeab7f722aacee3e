//! Per-operation metrics record
//!
//! One [`OperationMetrics`] tracks a single sync operation from start to
//! finish. Histories are bounded ring buffers so a multi-hour bulk sync
//! cannot grow its own bookkeeping without limit, and aggregate queries
//! are answered from running totals maintained on insert and eviction
//! rather than by walking retained samples.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ErrorClass;
use crate::governor::MemoryPressure;

/// Lifecycle state of a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    InProgress,
    Completed,
    Failed,
    /// Stopped by the resource governor or cancellation.
    Aborted,
}

/// Which way data flowed for this operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Storefront to ERP.
    Push,
    /// ERP to storefront.
    Pull,
}

/// One recorded failure within an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// 1-based attempt number within the retry sequence.
    pub attempt: u32,
    pub class: ErrorClass,
    pub message: String,
}

/// One memory reading taken during the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub timestamp: DateTime<Utc>,
    pub bytes: u64,
    pub pressure: MemoryPressure,
}

/// Aggregates for one processed batch. Re-recording a batch number
/// replaces the earlier record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchRecord {
    pub batch_number: u32,
    /// Items processed in this batch.
    pub item_count: u64,
    /// Items that failed in this batch.
    pub error_count: u64,
    /// Items reprocessed from the retry queue in this batch.
    pub retry_item_count: u64,
    /// Retry-queue items that failed again.
    pub retry_error_count: u64,
    pub duration_ms: u64,
}

/// Retention caps for the bounded histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCaps {
    pub max_errors: usize,
    pub max_memory_snapshots: usize,
    pub max_batches: usize,
}

impl Default for RecordCaps {
    fn default() -> Self {
        Self { max_errors: 100, max_memory_snapshots: 200, max_batches: 500 }
    }
}

/// Running totals kept current on insert and eviction so aggregate
/// queries never walk the retained samples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunningTotals {
    /// Sum of the bytes of currently retained memory samples.
    pub memory_sum_bytes: u64,
    /// Count of currently retained memory samples.
    pub memory_sample_count: u64,
    /// Highest reading ever observed; never decremented by eviction.
    pub peak_memory_bytes: u64,
    /// First reading of the operation, for end-of-run delta reporting.
    pub first_memory_bytes: Option<u64>,
    /// Sum of durations of currently retained batch records.
    pub batch_duration_sum_ms: u64,
    /// Count of currently retained batch records.
    pub batch_duration_count: u64,
    /// All errors ever recorded, including evicted ones.
    pub total_errors: u64,
    /// All errors ever recorded, by class.
    pub errors_by_class: HashMap<ErrorClass, u64>,
}

/// Aggregate memory view answered in O(1) from [`RunningTotals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryUsageStats {
    /// Most recent retained reading, 0 before the first sample.
    pub current_bytes: u64,
    /// Mean over the retained window.
    pub mean_bytes: u64,
    /// Highest reading ever observed for this operation.
    pub peak_bytes: u64,
    /// Growth since the operation's first reading.
    pub delta_bytes: i64,
    pub samples_retained: u64,
}

/// Aggregate batch view answered in O(1) from [`RunningTotals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub batches_retained: u64,
    /// Mean duration over the retained batch records.
    pub mean_duration_ms: u64,
}

/// Aggregate error view answered in O(1) from [`RunningTotals`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    /// All errors ever recorded, including evicted ones.
    pub total_errors: u64,
    pub by_class: HashMap<ErrorClass, u64>,
    pub retained: u64,
}

/// Full record for one sync operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub id: String,
    /// Logical operation name, e.g. `order.push`.
    pub operation: String,
    pub direction: SyncDirection,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub errors: VecDeque<ErrorRecord>,
    pub memory_samples: VecDeque<MemorySnapshot>,
    /// Batch records keyed by batch number; the smallest numbers are
    /// evicted first when over the cap.
    pub batches: BTreeMap<u32, BatchRecord>,
    pub totals: RunningTotals,
    #[serde(skip)]
    pub(crate) caps: RecordCaps,
    /// Configured batch size last reported for this operation; drives the
    /// governor sampling cadence.
    #[serde(skip)]
    pub(crate) batch_size_hint: u64,
    /// Insertion order within the collector, for oldest-first eviction.
    #[serde(skip)]
    pub(crate) seq: u64,
}

/// Default batch size assumed until the pipeline reports a real one.
pub(crate) const DEFAULT_BATCH_SIZE_HINT: u64 = 50;

impl OperationMetrics {
    pub fn new(
        id: impl Into<String>,
        operation: impl Into<String>,
        direction: SyncDirection,
        caps: RecordCaps,
    ) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            direction,
            status: OperationStatus::InProgress,
            started_at: Utc::now(),
            ended_at: None,
            items_processed: 0,
            items_succeeded: 0,
            items_failed: 0,
            errors: VecDeque::new(),
            memory_samples: VecDeque::new(),
            batches: BTreeMap::new(),
            totals: RunningTotals::default(),
            caps,
            batch_size_hint: DEFAULT_BATCH_SIZE_HINT,
            seq: 0,
        }
    }

    /// A terminal record for an id the collector never saw. All counters
    /// zero, started and ended both "now".
    pub fn zeroed(id: impl Into<String>, status: OperationStatus) -> Self {
        let now = Utc::now();
        let mut record =
            Self::new(id, "unknown", SyncDirection::Push, RecordCaps::default());
        record.status = status;
        record.started_at = now;
        record.ended_at = Some(now);
        record
    }

    /// Record a failure, evicting the oldest retained record when over
    /// the cap. Running error counts are monotonic and survive eviction.
    pub fn push_error(&mut self, record: ErrorRecord) {
        self.totals.total_errors += 1;
        *self.totals.errors_by_class.entry(record.class).or_insert(0) += 1;

        self.errors.push_back(record);
        while self.errors.len() > self.caps.max_errors {
            self.errors.pop_front();
        }
    }

    /// Record a memory reading, keeping the running sum and count in step
    /// with the retained window. The peak is monotonic.
    pub fn push_memory_snapshot(&mut self, snapshot: MemorySnapshot) {
        self.totals.first_memory_bytes.get_or_insert(snapshot.bytes);
        self.totals.memory_sum_bytes += snapshot.bytes;
        self.totals.memory_sample_count += 1;
        self.totals.peak_memory_bytes = self.totals.peak_memory_bytes.max(snapshot.bytes);

        self.memory_samples.push_back(snapshot);
        while self.memory_samples.len() > self.caps.max_memory_snapshots {
            if let Some(evicted) = self.memory_samples.pop_front() {
                self.totals.memory_sum_bytes -= evicted.bytes;
                self.totals.memory_sample_count -= 1;
            }
        }
    }

    /// Insert or replace a batch record, keeping the duration running
    /// totals in step with the retained records; lowest batch numbers are
    /// evicted when over the cap.
    pub fn upsert_batch(&mut self, record: BatchRecord) {
        if let Some(replaced) = self.batches.insert(record.batch_number, record) {
            self.totals.batch_duration_sum_ms -= replaced.duration_ms;
            self.totals.batch_duration_count -= 1;
        }
        self.totals.batch_duration_sum_ms += record.duration_ms;
        self.totals.batch_duration_count += 1;

        while self.batches.len() > self.caps.max_batches {
            if let Some((&oldest, _)) = self.batches.iter().next() {
                if let Some(evicted) = self.batches.remove(&oldest) {
                    self.totals.batch_duration_sum_ms -= evicted.duration_ms;
                    self.totals.batch_duration_count -= 1;
                }
            }
        }
    }

    /// O(1) memory aggregate over the retained window.
    ///
    /// Falls back to a full scan of the retained samples if the running
    /// totals are inconsistent with them; not the common path.
    pub fn memory_stats(&self) -> MemoryUsageStats {
        let (sum, count) =
            if self.totals.memory_sample_count as usize != self.memory_samples.len() {
                let sum: u64 = self.memory_samples.iter().map(|s| s.bytes).sum();
                (sum, self.memory_samples.len() as u64)
            } else {
                (self.totals.memory_sum_bytes, self.totals.memory_sample_count)
            };
        let current_bytes = self.memory_samples.back().map_or(0, |s| s.bytes);
        let first_bytes = self.totals.first_memory_bytes.unwrap_or(current_bytes);
        MemoryUsageStats {
            current_bytes,
            mean_bytes: if count == 0 { 0 } else { sum / count },
            peak_bytes: self.totals.peak_memory_bytes,
            delta_bytes: current_bytes as i64 - first_bytes as i64,
            samples_retained: count,
        }
    }

    /// O(1) batch aggregate over the retained records.
    pub fn batch_stats(&self) -> BatchStats {
        let count = self.totals.batch_duration_count;
        BatchStats {
            batches_retained: count,
            mean_duration_ms: if count == 0 {
                0
            } else {
                self.totals.batch_duration_sum_ms / count
            },
        }
    }

    /// O(1) error aggregate; totals include evicted records.
    pub fn error_stats(&self) -> ErrorStats {
        ErrorStats {
            total_errors: self.totals.total_errors,
            by_class: self.totals.errors_by_class.clone(),
            retained: self.errors.len() as u64,
        }
    }

    /// Wall-clock duration, `None` while still in progress.
    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at.map(|ended| {
            (ended - self.started_at).num_milliseconds().max(0) as u64
        })
    }
}
