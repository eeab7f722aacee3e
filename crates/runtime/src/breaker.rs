//! Call-gated circuit breaker for remote endpoints
//!
//! The breaker trips after a run of consecutive infrastructure failures and
//! sheds load until a recovery timeout elapses. There is no background
//! timer: the open-to-half-open transition happens lazily inside
//! [`CircuitBreaker::allow`], so a breaker that nobody calls stays open
//! and costs nothing.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult, SyncError};
use crate::time::{Clock, SystemClock};

/// Default consecutive failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the breaker stays open before probing.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default concurrent probe budget while half-open.
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 1;

/// Circuit breaker tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` before opening (must be ≥ 1).
    pub failure_threshold: u32,
    /// How long `Open` lasts before the next call may probe.
    pub recovery_timeout: Duration,
    /// How many probe calls `HalfOpen` admits at once (must be ≥ 1).
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

impl BreakerConfig {
    pub fn builder() -> BreakerConfigBuilder {
        BreakerConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::invalid("recovery_timeout must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`BreakerConfig`] with validation at `build()`.
#[derive(Debug, Default)]
pub struct BreakerConfigBuilder {
    config: BreakerConfig,
}

impl BreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: BreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    pub fn half_open_max_calls(mut self, calls: u32) -> Self {
        self.config.half_open_max_calls = calls;
        self
    }

    pub fn build(self) -> ConfigResult<BreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Breaker state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; failures are counted.
    Closed,
    /// Shedding load; calls are rejected without touching the network.
    Open,
    /// Probing; a bounded number of trial calls are admitted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Point-in-time view of a breaker for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BreakerSnapshot {
    pub endpoint: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Calls admitted through `allow`.
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    /// Milliseconds until the breaker will probe again, if currently open.
    pub retry_after_ms: Option<u64>,
}

/// Mutable state guarded by the lock. Counters that are read on hot paths
/// live outside as atomics.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Clock-relative millis when the breaker last opened.
    opened_at_ms: u64,
    /// In-flight probe calls while half-open.
    half_open_in_flight: u32,
}

/// Circuit breaker for a single remote endpoint.
///
/// All methods take `&self`; the breaker is shared behind an `Arc` across
/// orchestrators hitting the same endpoint.
#[derive(Debug)]
pub struct CircuitBreaker<C: Clock = SystemClock> {
    endpoint: String,
    config: BreakerConfig,
    state: RwLock<BreakerState>,
    consecutive_failures: AtomicU32,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
    clock: C,
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker with the system clock.
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(endpoint, config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with an explicit clock (tests inject `MockClock`).
    pub fn with_clock(endpoint: impl Into<String>, config: BreakerConfig, clock: C) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            state: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                opened_at_ms: 0,
                half_open_in_flight: 0,
            }),
            consecutive_failures: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            clock,
        }
    }

    /// The endpoint this breaker guards.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Gate a call. `Ok(())` admits it; `Err(SyncError::CircuitOpen)`
    /// rejects it without any network activity.
    ///
    /// Performs the lazy open-to-half-open transition when the recovery
    /// timeout has elapsed.
    pub fn allow(&self) -> Result<(), SyncError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.state {
            CircuitState::Closed => {
                self.total_calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            CircuitState::Open => {
                let elapsed_ms = self.clock.millis_since_epoch().saturating_sub(state.opened_at_ms);
                let timeout_ms = self.config.recovery_timeout.as_millis() as u64;
                if elapsed_ms >= timeout_ms {
                    info!(endpoint = %self.endpoint, "circuit breaker half-open, admitting probe");
                    state.state = CircuitState::HalfOpen;
                    state.half_open_in_flight = 1;
                    self.total_calls.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    let remaining = Duration::from_millis(timeout_ms - elapsed_ms);
                    debug!(
                        endpoint = %self.endpoint,
                        remaining_ms = remaining.as_millis() as u64,
                        "circuit breaker open, rejecting call"
                    );
                    Err(SyncError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                        retry_after: Some(remaining),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight < self.config.half_open_max_calls {
                    state.half_open_in_flight += 1;
                    self.total_calls.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    Err(SyncError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                        retry_after: None,
                    })
                }
            }
        }
    }

    /// Report the outcome of an admitted call.
    ///
    /// Only outcomes that should influence the breaker belong here: the
    /// caller must not report terminal client errors, which say nothing
    /// about endpoint health.
    pub fn record_result(&self, success: bool) {
        if success {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    fn record_success(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        match state.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                // A single successful probe is proof enough of recovery.
                info!(endpoint = %self.endpoint, "circuit breaker closed after successful probe");
                state.state = CircuitState::Closed;
                state.half_open_in_flight = 0;
            }
            CircuitState::Open => {
                // A call admitted before the breaker opened may complete
                // late; the success does not reopen admission on its own.
                debug!(endpoint = %self.endpoint, "late success while breaker open, ignoring");
            }
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        match state.state {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.failure_threshold {
                    warn!(
                        endpoint = %self.endpoint,
                        consecutive_failures = failures,
                        recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                        "circuit breaker opened"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at_ms = self.clock.millis_since_epoch();
                }
            }
            CircuitState::HalfOpen => {
                // The probe failed; go back to shedding load for a fresh
                // recovery window.
                warn!(endpoint = %self.endpoint, "circuit breaker reopened after failed probe");
                state.state = CircuitState::Open;
                state.opened_at_ms = self.clock.millis_since_epoch();
                state.half_open_in_flight = 0;
            }
            CircuitState::Open => {
                debug!(endpoint = %self.endpoint, "late failure while breaker open, ignoring");
            }
        }
    }

    /// Current state, applying the same lazy transition `allow` would.
    pub fn state(&self) -> CircuitState {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.state == CircuitState::Open {
            let elapsed_ms = self.clock.millis_since_epoch().saturating_sub(state.opened_at_ms);
            if elapsed_ms >= self.config.recovery_timeout.as_millis() as u64 {
                return CircuitState::HalfOpen;
            }
        }
        state.state
    }

    /// Consecutive failure count since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Calls rejected while open or over the half-open probe budget.
    pub fn rejected_calls(&self) -> u64 {
        self.rejected_calls.load(Ordering::Relaxed)
    }

    /// Point-in-time view for diagnostics and logs.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let retry_after_ms = if state.state == CircuitState::Open {
            let elapsed_ms = self.clock.millis_since_epoch().saturating_sub(state.opened_at_ms);
            let timeout_ms = self.config.recovery_timeout.as_millis() as u64;
            Some(timeout_ms.saturating_sub(elapsed_ms))
        } else {
            None
        };
        BreakerSnapshot {
            endpoint: self.endpoint.clone(),
            state: state.state,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            retry_after_ms,
        }
    }

    /// Force the breaker back to `Closed`, clearing counters. Operator
    /// escape hatch; normal recovery goes through the probe path.
    pub fn reset(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        info!(endpoint = %self.endpoint, "circuit breaker manually reset");
        state.state = CircuitState::Closed;
        state.half_open_in_flight = 0;
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }
}
