//! Resilience runtime for storefront-to-ERP synchronization
//!
//! Small-business deployments talk to their ERP backends over links that
//! drop, stall, and throttle. This crate wraps those conversations in the
//! machinery needed to survive that: cascading retry policies with
//! backoff and jitter, per-endpoint circuit breakers, a memory-pressure
//! governor for long bulk runs, and bounded per-operation metrics.
//!
//! The pieces compose around [`RetryOrchestrator`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use syncline_runtime::{
//!     BreakerConfig, CircuitBreaker, PolicyResolver, RetryOrchestrator, RetryPolicies,
//! };
//!
//! # async fn demo() -> syncline_runtime::SyncResult<()> {
//! let resolver = Arc::new(PolicyResolver::new().with_default(RetryPolicies::bulk_sync()));
//! let breaker = Arc::new(CircuitBreaker::new("erp.main", BreakerConfig::default()));
//! let orchestrator = RetryOrchestrator::new(resolver, breaker);
//!
//! let order = orchestrator
//!     .execute("order.push", |_attempt| async {
//!         // call the ERP transport here
//!         # Ok::<_, syncline_runtime::TransportError>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod breaker;
pub mod error;
pub mod governor;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod time;
pub mod transport;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use error::{
    ConfigError, ConfigResult, ErrorClass, ErrorClassification, ErrorSeverity, SyncError,
    SyncResult,
};
pub use governor::{
    Environment, GovernorConfig, MemoryPressure, MemoryProbe, MemoryStatsSnapshot,
    ResourceGovernor, StaticMemoryProbe,
};
pub use metrics::{
    CollectorConfig, MetricsCollector, MetricsSink, OperationMetrics, OperationStatus,
    SyncDirection,
};
pub use orchestrator::{RetryOrchestrator, RetryOutcome};
pub use policy::{BackoffKind, PolicyResolver, RetryPolicies, RetryPolicy};
pub use time::{Clock, MockClock, SystemClock};
pub use transport::{Transport, TransportError, TransportRequest, TransportResponse};
