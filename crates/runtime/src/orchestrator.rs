//! Retry orchestration
//!
//! [`RetryOrchestrator`] drives an attempt sequence for one logical call:
//! gate through the circuit breaker, invoke the transport operation,
//! classify the failure, back off, and try again until success, attempt
//! exhaustion, a terminal error, or cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{ErrorClass, ErrorClassification, SyncError, SyncResult};
use crate::policy::{PolicyResolver, RetryPolicy, RATE_LIMIT_FLOOR_DELAY};
use crate::time::{Clock, SystemClock};
use crate::transport::TransportError;

/// Summary of a completed attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    /// The successful result.
    pub value: T,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
    /// Total time spent sleeping between attempts.
    pub total_delay: Duration,
}

/// Drives retry sequences against one remote endpoint.
///
/// Cheap to clone; orchestrators hitting the same endpoint share the
/// breaker through the `Arc`.
#[derive(Debug, Clone)]
pub struct RetryOrchestrator<C: Clock = SystemClock> {
    resolver: Arc<PolicyResolver>,
    breaker: Arc<CircuitBreaker<C>>,
    cancellation: CancellationToken,
}

impl<C: Clock> RetryOrchestrator<C> {
    pub fn new(resolver: Arc<PolicyResolver>, breaker: Arc<CircuitBreaker<C>>) -> Self {
        Self {
            resolver,
            breaker,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach a cancellation token; backoff sleeps abort promptly when it
    /// fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The breaker guarding this orchestrator's endpoint.
    pub fn breaker(&self) -> &CircuitBreaker<C> {
        &self.breaker
    }

    /// Execute `operation` with retries, returning only the value.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, operation: F) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.execute_with_outcome(operation_name, operation).await.map(|outcome| outcome.value)
    }

    /// Execute `operation` with retries, returning the value plus attempt
    /// accounting.
    ///
    /// The policy is resolved once at the start and re-resolved exactly
    /// once when the first failure reveals the error class; after that it
    /// is locked for the rest of the sequence, so a single call never
    /// mixes backoff curves.
    #[instrument(skip(self, operation), fields(endpoint = %self.breaker.endpoint()))]
    pub async fn execute_with_outcome<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> SyncResult<RetryOutcome<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut policy = self.resolver.resolve(operation_name, None);
        let mut policy_locked = false;
        let mut total_delay = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            if self.cancellation.is_cancelled() {
                return Err(SyncError::Cancelled { operation: operation_name.to_string() });
            }

            self.breaker.allow()?;
            attempt += 1;

            match operation(attempt).await {
                Ok(value) => {
                    self.breaker.record_result(true);
                    if attempt > 1 {
                        info!(operation = operation_name, attempt, "call succeeded after retries");
                    }
                    return Ok(RetryOutcome { value, attempts: attempt, total_delay });
                }
                Err(error) => {
                    let class = error.class();

                    if !class.is_retryable() {
                        // Terminal errors say nothing about endpoint
                        // health; the breaker never sees them.
                        debug!(
                            operation = operation_name,
                            %class,
                            error = %error,
                            "terminal error, not retrying"
                        );
                        return Err(SyncError::Terminal { source: error });
                    }

                    self.breaker.record_result(false);

                    if !policy_locked {
                        policy = self.resolver.resolve(operation_name, Some(class));
                        policy_locked = true;
                    }

                    if attempt >= policy.max_attempts {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %error,
                            "retry budget exhausted"
                        );
                        return Err(SyncError::RetryExhausted { attempts: attempt, source: error });
                    }

                    let delay = self.delay_for(&policy, attempt - 1, class, &error);
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %class,
                        error = %error,
                        "transient failure, backing off"
                    );

                    total_delay += delay;
                    self.sleep(operation_name, delay).await?;
                }
            }
        }
    }

    /// Backoff delay for a failed attempt, applying the rate-limit floor
    /// and any server-provided retry hint.
    fn delay_for(
        &self,
        policy: &RetryPolicy,
        attempt: u32,
        class: ErrorClass,
        error: &TransportError,
    ) -> Duration {
        let mut delay = policy.delay_for(attempt);
        if class == ErrorClass::RateLimited {
            delay = delay.max(RATE_LIMIT_FLOOR_DELAY);
            if let Some(hint) = error.retry_after() {
                delay = delay.max(hint);
            }
        }
        delay
    }

    /// Sleep for the backoff delay, aborting promptly on cancellation.
    async fn sleep(&self, operation_name: &str, delay: Duration) -> SyncResult<()> {
        tokio::select! {
            _ = self.cancellation.cancelled() => {
                info!(operation = operation_name, "retry sequence cancelled during backoff");
                Err(SyncError::Cancelled { operation: operation_name.to_string() })
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
