//! Integration tests for the metrics collector wired to a governor and
//! an export sink, the way the sync engine composes them.

use std::sync::Arc;

use anyhow::Context;
use syncline_runtime::metrics::{
    BatchRecord, CollectorConfig, MemorySink, MetricsCollector, MetricsSink, OperationStatus,
    SyncDirection,
};
use syncline_runtime::{
    ErrorClass, GovernorConfig, MemoryProbe, ResourceGovernor, StaticMemoryProbe,
};

const MB: u64 = 1024 * 1024;

fn governed_collector(
    config: CollectorConfig,
    current: u64,
    limit: u64,
) -> (MetricsCollector, Arc<StaticMemoryProbe>, Arc<MemorySink>) {
    let probe = Arc::new(StaticMemoryProbe::new(current, limit));
    let governor = Arc::new(ResourceGovernor::new(
        GovernorConfig::builder(limit).buffer_ratio(1.0).build().unwrap(),
        Arc::clone(&probe) as Arc<dyn MemoryProbe>,
    ));
    let sink = Arc::new(MemorySink::new());
    let collector = MetricsCollector::with_sink(config, Arc::clone(&sink) as Arc<dyn MetricsSink>)
        .with_governor(governor);
    (collector, probe, sink)
}

/// Full lifecycle of a bulk pull: items, batches, errors, memory
/// sampling, and the final flushed record.
#[test]
fn test_bulk_operation_lifecycle() -> anyhow::Result<()> {
    let (collector, probe, sink) =
        governed_collector(CollectorConfig::default(), 100 * MB, 1000 * MB);

    collector.start_operation("pull-7", "inventory.pull", SyncDirection::Pull);

    // Two batches of 100. Sampling cadence follows the batch-size hint:
    // the default hint of 50 (interval 5) covers the first batch, and the
    // recorded size of 100 (interval 10) takes over for the second.
    for batch_number in 1..=2u32 {
        for _ in 0..100 {
            collector.record_item_processed("pull-7", true);
        }
        collector.record_batch_metrics(
            "pull-7",
            BatchRecord {
                batch_number,
                item_count: 100,
                error_count: 1,
                retry_item_count: 0,
                retry_error_count: 0,
                duration_ms: 850,
            },
        );
        collector.record_error("pull-7", 1, ErrorClass::RetryableTransport, "item rejected");
        probe.set_current((100 + batch_number as u64 * 50) * MB);
    }

    let memory = collector.memory_stats("pull-7").context("operation should be live")?;
    assert!(memory.samples_retained > 0);
    assert!(memory.peak_bytes >= memory.mean_bytes);

    let errors = collector.error_stats("pull-7").context("operation should be live")?;
    assert_eq!(errors.total_errors, 2);

    let record = collector.end_operation("pull-7", OperationStatus::Completed);
    assert_eq!(record.items_processed, 200);
    assert_eq!(record.batches.len(), 2);
    assert_eq!(record.status, OperationStatus::Completed);

    // Exactly one flushed record, matching what end_operation returned.
    let flushed = sink.flushed();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].items_processed, 200);
    Ok(())
}

/// Memory sampling follows the batch-size hint: small batches sample
/// every item, and the mean stays consistent with the retained window
/// as old samples are evicted.
#[test]
fn test_memory_sampling_and_running_totals() {
    let config = CollectorConfig::builder().max_memory_snapshots(10).build().unwrap();
    let (collector, probe, _sink) = governed_collector(config, 100 * MB, 1000 * MB);

    collector.start_operation("push-1", "order.push", SyncDirection::Push);
    // Batch size 5 means a sample on every item.
    collector.record_batch_metrics(
        "push-1",
        BatchRecord {
            batch_number: 1,
            item_count: 5,
            error_count: 0,
            retry_item_count: 0,
            retry_error_count: 0,
            duration_ms: 40,
        },
    );

    // 30 items with rising usage; only the last 10 samples are retained.
    for i in 1..=30u64 {
        probe.set_current(i * 10 * MB);
        collector.record_item_processed("push-1", true);
    }

    let stats = collector.memory_stats("push-1").unwrap();
    assert_eq!(stats.samples_retained, 10);
    // Retained window is samples 21..=30.
    let expected_mean: u64 = (21..=30).map(|i| i * 10 * MB).sum::<u64>() / 10;
    assert_eq!(stats.mean_bytes, expected_mean);
    assert_eq!(stats.current_bytes, 300 * MB);
    // The peak equals the latest reading since usage only rose.
    assert_eq!(stats.peak_bytes, 300 * MB);
}

#[test]
fn test_error_history_bounded_but_counts_complete() {
    let config = CollectorConfig::builder().max_errors_per_operation(25).build().unwrap();
    let sink = Arc::new(MemorySink::new());
    let collector =
        MetricsCollector::with_sink(config, Arc::clone(&sink) as Arc<dyn MetricsSink>);

    collector.start_operation("push-2", "order.push", SyncDirection::Push);
    for attempt in 1..=100u32 {
        let class = if attempt % 10 == 0 {
            ErrorClass::RateLimited
        } else {
            ErrorClass::RetryableTransport
        };
        collector.record_error("push-2", attempt, class, "transient");
    }

    let stats = collector.error_stats("push-2").unwrap();
    assert_eq!(stats.total_errors, 100);
    assert_eq!(stats.retained, 25);
    assert_eq!(stats.by_class[&ErrorClass::RateLimited], 10);
    assert_eq!(stats.by_class[&ErrorClass::RetryableTransport], 90);

    let record = collector.end_operation("push-2", OperationStatus::Failed);
    assert_eq!(record.errors.len(), 25);
    assert_eq!(record.totals.total_errors, 100);
}

/// At the 50-operation cap the oldest record is evicted and flushed
/// exactly once; ending it again later yields a zeroed record rather
/// than a second flush.
#[test]
fn test_operation_cap_eviction_flushes_exactly_once() {
    let config = CollectorConfig::builder().max_active_operations(50).build().unwrap();
    let sink = Arc::new(MemorySink::new());
    let collector =
        MetricsCollector::with_sink(config, Arc::clone(&sink) as Arc<dyn MetricsSink>);

    for i in 0..50 {
        collector.start_operation(format!("op-{i}"), "order.push", SyncDirection::Push);
        collector.record_item_processed(&format!("op-{i}"), true);
    }
    assert_eq!(collector.snapshot().active_operations, 50);
    assert_eq!(sink.flushed_count(), 0);

    collector.start_operation("op-50", "order.push", SyncDirection::Push);

    let snap = collector.snapshot();
    assert_eq!(snap.active_operations, 50);
    assert_eq!(snap.evicted_operations, 1);
    assert_eq!(sink.flushed_count(), 1);
    assert_eq!(sink.flushed()[0].id, "op-0");
    assert_eq!(sink.flushed()[0].status, OperationStatus::Aborted);

    // The evicted id is gone; ending it is the unknown-id path.
    let record = collector.end_operation("op-0", OperationStatus::Completed);
    assert_eq!(record.items_processed, 0);
    assert_eq!(sink.flushed_count(), 1);
}

#[test]
fn test_flushed_record_serializes() {
    let sink = Arc::new(MemorySink::new());
    let collector = MetricsCollector::with_sink(
        CollectorConfig::default(),
        Arc::clone(&sink) as Arc<dyn MetricsSink>,
    );

    collector.start_operation("op-1", "customer.pull", SyncDirection::Pull);
    collector.record_item_processed("op-1", true);
    collector.record_error("op-1", 1, ErrorClass::TerminalClient, "bad address");
    collector.end_operation("op-1", OperationStatus::Failed);

    let json = serde_json::to_value(&sink.flushed()[0]).unwrap();
    assert_eq!(json["id"], "op-1");
    assert_eq!(json["operation"], "customer.pull");
    assert_eq!(json["status"], "failed");
    assert_eq!(json["items_processed"], 1);
    assert_eq!(json["totals"]["total_errors"], 1);
}
