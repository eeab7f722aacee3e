//! Bounded sync-metrics collector
//!
//! [`MetricsCollector`] owns the live [`OperationMetrics`] records for all
//! in-flight sync operations. Every dimension is bounded: per-operation
//! histories by [`RecordCaps`], and the set of active operations by
//! `max_active_operations`, with the oldest record flushed to the sink and
//! dropped when a new operation would exceed the cap. The collector sits
//! on the hot path of item processing, so per-item work is a counter
//! increment and an occasional governor sample.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{ConfigError, ConfigResult, ErrorClass};
use crate::governor::ResourceGovernor;

use super::operation::{
    BatchRecord, ErrorRecord, ErrorStats, MemorySnapshot, MemoryUsageStats, OperationMetrics,
    OperationStatus, RecordCaps, SyncDirection,
};
use super::sink::{MetricsSink, NullSink};

/// Collector capacity limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Concurrent operation records kept before oldest-first eviction.
    pub max_active_operations: usize,
    pub max_errors_per_operation: usize,
    pub max_memory_snapshots: usize,
    pub max_batches_per_operation: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_active_operations: 100,
            max_errors_per_operation: 100,
            max_memory_snapshots: 200,
            max_batches_per_operation: 500,
        }
    }
}

impl CollectorConfig {
    pub fn builder() -> CollectorConfigBuilder {
        CollectorConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (name, value) in [
            ("max_active_operations", self.max_active_operations),
            ("max_errors_per_operation", self.max_errors_per_operation),
            ("max_memory_snapshots", self.max_memory_snapshots),
            ("max_batches_per_operation", self.max_batches_per_operation),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    fn record_caps(&self) -> RecordCaps {
        RecordCaps {
            max_errors: self.max_errors_per_operation,
            max_memory_snapshots: self.max_memory_snapshots,
            max_batches: self.max_batches_per_operation,
        }
    }
}

/// Builder for [`CollectorConfig`] with validation at `build()`.
#[derive(Debug, Default)]
pub struct CollectorConfigBuilder {
    config: CollectorConfig,
}

impl CollectorConfigBuilder {
    pub fn new() -> Self {
        Self { config: CollectorConfig::default() }
    }

    pub fn max_active_operations(mut self, max: usize) -> Self {
        self.config.max_active_operations = max;
        self
    }

    pub fn max_errors_per_operation(mut self, max: usize) -> Self {
        self.config.max_errors_per_operation = max;
        self
    }

    pub fn max_memory_snapshots(mut self, max: usize) -> Self {
        self.config.max_memory_snapshots = max;
        self
    }

    pub fn max_batches_per_operation(mut self, max: usize) -> Self {
        self.config.max_batches_per_operation = max;
        self
    }

    pub fn build(self) -> ConfigResult<CollectorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Collector-wide counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CollectorSnapshot {
    pub active_operations: usize,
    /// Records evicted because `max_active_operations` was hit.
    pub evicted_operations: u64,
    /// Records flushed to the sink, evictions included.
    pub flushed_operations: u64,
    /// Sink flushes that failed and were swallowed.
    pub failed_flushes: u64,
}

/// Thread-safe collector for in-flight sync operation metrics.
pub struct MetricsCollector {
    config: CollectorConfig,
    operations: Mutex<HashMap<String, OperationMetrics>>,
    sink: Arc<dyn MetricsSink>,
    governor: Option<Arc<ResourceGovernor>>,
    next_seq: AtomicU64,
    evicted_operations: AtomicU64,
    flushed_operations: AtomicU64,
    failed_flushes: AtomicU64,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").field("config", &self.config).finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// Collector with no export sink and no governor sampling.
    pub fn new(config: CollectorConfig) -> Self {
        Self::with_sink(config, Arc::new(NullSink))
    }

    pub fn with_sink(config: CollectorConfig, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            config,
            operations: Mutex::new(HashMap::new()),
            sink,
            governor: None,
            next_seq: AtomicU64::new(0),
            evicted_operations: AtomicU64::new(0),
            flushed_operations: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
        }
    }

    /// Attach a governor; the collector then samples memory pressure on
    /// the item-processing cadence the governor recommends.
    pub fn with_governor(mut self, governor: Arc<ResourceGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    /// Begin tracking an operation. Starting an id that is already live
    /// replaces the old record after flushing it.
    pub fn start_operation(
        &self,
        id: impl Into<String>,
        operation: impl Into<String>,
        direction: SyncDirection,
    ) {
        let id = id.into();
        let mut record =
            OperationMetrics::new(id.clone(), operation, direction, self.config.record_caps());
        record.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut ops = self.operations.lock();
        if let Some(mut previous) = ops.remove(&id) {
            warn!(operation_id = %id, "operation restarted while still live, flushing old record");
            previous.status = OperationStatus::Aborted;
            previous.ended_at = Some(Utc::now());
            self.flush(&previous);
        }

        if ops.len() >= self.config.max_active_operations {
            self.evict_oldest(&mut ops);
        }
        debug!(operation_id = %id, "operation tracking started");
        ops.insert(id, record);
    }

    /// Count one processed item, sampling memory pressure on the
    /// governor's recommended interval. Unknown ids are tracked from
    /// scratch so late registration never loses counts.
    pub fn record_item_processed(&self, id: &str, success: bool) {
        let mut ops = self.operations.lock();
        let record = self.entry_or_create(&mut ops, id);
        record.items_processed += 1;
        if success {
            record.items_succeeded += 1;
        } else {
            record.items_failed += 1;
        }

        if let Some(governor) = &self.governor {
            let interval = governor.check_interval(record.batch_size_hint);
            if record.items_processed % interval == 0 {
                let pressure = governor.current_pressure();
                let reading = governor.sample();
                record.push_memory_snapshot(MemorySnapshot {
                    timestamp: Utc::now(),
                    bytes: reading.current_bytes,
                    pressure,
                });
            }
        }
    }

    /// Record a failure against an operation.
    pub fn record_error(
        &self,
        id: &str,
        attempt: u32,
        class: ErrorClass,
        message: impl Into<String>,
    ) {
        let mut ops = self.operations.lock();
        let record = self.entry_or_create(&mut ops, id);
        record.push_error(ErrorRecord {
            timestamp: Utc::now(),
            attempt,
            class,
            message: message.into(),
        });
    }

    /// Record per-batch aggregates; also updates the batch-size hint that
    /// drives memory sampling cadence.
    pub fn record_batch_metrics(&self, id: &str, batch: BatchRecord) {
        let mut ops = self.operations.lock();
        let record = self.entry_or_create(&mut ops, id);
        if batch.item_count > 0 {
            record.batch_size_hint = batch.item_count;
        }
        record.upsert_batch(batch);
    }

    /// Record an explicit memory reading, bypassing the sampling cadence.
    pub fn record_memory_snapshot(&self, id: &str, snapshot: MemorySnapshot) {
        let mut ops = self.operations.lock();
        let record = self.entry_or_create(&mut ops, id);
        record.push_memory_snapshot(snapshot);
    }

    /// Finish an operation: stamp the end, flush to the sink, drop the
    /// live record, and return the final record.
    ///
    /// An id the collector has never seen returns a zeroed record so
    /// callers on shutdown paths never have to special-case it.
    pub fn end_operation(&self, id: &str, status: OperationStatus) -> OperationMetrics {
        let removed = self.operations.lock().remove(id);
        let mut record = match removed {
            Some(record) => record,
            None => {
                warn!(operation_id = %id, "ending unknown operation, returning zeroed record");
                return OperationMetrics::zeroed(id, status);
            }
        };
        record.status = status;
        record.ended_at = Some(Utc::now());
        // A closing reading so the flushed record carries the memory delta
        // for the whole run.
        if let Some(governor) = &self.governor {
            let pressure = governor.current_pressure();
            let reading = governor.sample();
            record.push_memory_snapshot(MemorySnapshot {
                timestamp: Utc::now(),
                bytes: reading.current_bytes,
                pressure,
            });
        }
        debug!(
            operation_id = %id,
            status = ?status,
            items_processed = record.items_processed,
            total_errors = record.totals.total_errors,
            "operation tracking ended"
        );
        self.flush(&record);
        record
    }

    /// O(1) memory aggregate for a live operation.
    pub fn memory_stats(&self, id: &str) -> Option<MemoryUsageStats> {
        self.operations.lock().get(id).map(OperationMetrics::memory_stats)
    }

    /// O(1) error aggregate for a live operation.
    pub fn error_stats(&self, id: &str) -> Option<ErrorStats> {
        self.operations.lock().get(id).map(OperationMetrics::error_stats)
    }

    /// Clone of a live operation record.
    pub fn operation(&self, id: &str) -> Option<OperationMetrics> {
        self.operations.lock().get(id).cloned()
    }

    /// Collector-wide counters.
    pub fn snapshot(&self) -> CollectorSnapshot {
        CollectorSnapshot {
            active_operations: self.operations.lock().len(),
            evicted_operations: self.evicted_operations.load(Ordering::Relaxed),
            flushed_operations: self.flushed_operations.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
        }
    }

    fn entry_or_create<'a>(
        &self,
        ops: &'a mut HashMap<String, OperationMetrics>,
        id: &str,
    ) -> &'a mut OperationMetrics {
        if !ops.contains_key(id) {
            warn!(operation_id = %id, "recording against unknown operation, tracking from scratch");
            if ops.len() >= self.config.max_active_operations {
                self.evict_oldest(ops);
            }
            let mut record = OperationMetrics::new(
                id,
                "unknown",
                SyncDirection::Push,
                self.config.record_caps(),
            );
            record.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            ops.insert(id.to_string(), record);
        }
        // Inserted above if absent.
        ops.get_mut(id).unwrap_or_else(|| unreachable!("record inserted above"))
    }

    /// Evict the oldest live record, flushing it exactly once.
    fn evict_oldest(&self, ops: &mut HashMap<String, OperationMetrics>) {
        let oldest_id = ops.values().min_by_key(|r| r.seq).map(|r| r.id.clone());
        if let Some(id) = oldest_id {
            if let Some(mut evicted) = ops.remove(&id) {
                warn!(
                    operation_id = %id,
                    active = ops.len(),
                    "active operation cap reached, evicting oldest record"
                );
                evicted.status = OperationStatus::Aborted;
                evicted.ended_at = Some(Utc::now());
                self.evicted_operations.fetch_add(1, Ordering::Relaxed);
                self.flush(&evicted);
            }
        }
    }

    /// Flush a finished record. Failures are logged and swallowed;
    /// metrics export must never fail a sync operation.
    fn flush(&self, record: &OperationMetrics) {
        match self.sink.flush(record) {
            Ok(()) => {
                self.flushed_operations.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                error!(operation_id = %record.id, error = %e, "metrics sink flush failed");
            }
        }
    }
}
