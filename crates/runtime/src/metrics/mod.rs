//! Sync operation metrics: bounded collection, O(1) aggregates, export.

pub mod collector;
pub mod operation;
pub mod sink;

pub use collector::{CollectorConfig, CollectorConfigBuilder, CollectorSnapshot, MetricsCollector};
pub use operation::{
    BatchRecord, BatchStats, ErrorRecord, ErrorStats, MemorySnapshot, MemoryUsageStats,
    OperationMetrics,
    OperationStatus, RecordCaps, RunningTotals, SyncDirection,
};
pub use sink::{MemorySink, MetricsSink, NullSink, SinkError};
