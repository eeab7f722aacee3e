//! Metrics export seam
//!
//! Finished operation records leave the collector through a [`MetricsSink`].
//! Flushing happens on the collector's lock paths, so sinks must be quick;
//! anything slow belongs behind a channel the sink owns.

use parking_lot::Mutex;
use thiserror::Error;

use super::operation::OperationMetrics;

/// Errors a sink may surface. The collector logs and swallows them;
/// metrics export must never fail a sync operation.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("metrics sink unavailable: {message}")]
    Unavailable { message: String },

    #[error("failed to serialize metrics record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SinkError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }
}

/// Destination for finished operation records.
pub trait MetricsSink: Send + Sync {
    fn flush(&self, record: &OperationMetrics) -> Result<(), SinkError>;
}

/// Discards every record. Default when no export target is configured.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn flush(&self, _record: &OperationMetrics) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Buffers flushed records in memory for inspection by tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<OperationMetrics>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones of everything flushed so far, in flush order.
    pub fn flushed(&self) -> Vec<OperationMetrics> {
        self.records.lock().clone()
    }

    pub fn flushed_count(&self) -> usize {
        self.records.lock().len()
    }
}

impl MetricsSink for MemorySink {
    fn flush(&self, record: &OperationMetrics) -> Result<(), SinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::operation::{OperationMetrics, RecordCaps, SyncDirection};

    #[test]
    fn test_null_sink_accepts_everything() {
        let record =
            OperationMetrics::new("op-1", "order.push", SyncDirection::Push, RecordCaps::default());
        assert!(NullSink.flush(&record).is_ok());
    }

    #[test]
    fn test_memory_sink_preserves_order() {
        let sink = MemorySink::new();
        for i in 0..3 {
            let record = OperationMetrics::new(
                format!("op-{i}"),
                "order.push",
                SyncDirection::Push,
                RecordCaps::default(),
            );
            sink.flush(&record).unwrap();
        }

        let flushed = sink.flushed();
        assert_eq!(flushed.len(), 3);
        assert_eq!(flushed[0].id, "op-0");
        assert_eq!(flushed[2].id, "op-2");
    }
}
