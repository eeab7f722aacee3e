//! Retry policies and cascading policy resolution
//!
//! A [`RetryPolicy`] describes one attempt sequence: attempt budget, backoff
//! curve, clamp, and jitter. The [`PolicyResolver`] picks the effective
//! policy for an `(operation, error class)` pair via cascading fallback:
//! exact match, then operation-only match, then the configured default,
//! then a hard-coded safety net. Resolution never fails; absent
//! configuration degrades to defaults, because the resilience layer must
//! not itself become a new failure point.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult, ErrorClass};

/// Default attempt budget when nothing is configured.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default multiplier for exponential backoff.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Default cap on any computed delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Symmetric jitter applied to computed delays (±10%).
pub const JITTER_RATIO: f64 = 0.1;

/// Smallest delay a jittered backoff may produce.
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Courtesy floor delay for HTTP 429, regardless of computed backoff.
pub const RATE_LIMIT_FLOOR_DELAY: Duration = Duration::from_secs(30);

/// Cap on the backoff exponent to prevent overflow on long sequences.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Backoff curve selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    /// `base_delay` for every attempt.
    Fixed,
    /// `base_delay * (attempt + 1)`.
    Linear,
    /// `base_delay * backoff_factor^attempt` (the default).
    #[default]
    Exponential,
    /// Caller-supplied delay function of the 0-based attempt index, still
    /// subject to the `max_delay` clamp and jitter.
    Custom(fn(u32) -> Duration),
}

/// An immutable retry policy for one attempt sequence.
///
/// Re-resolved per logical call; never mutated while a sequence runs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (must be ≥ 1).
    pub max_attempts: u32,
    /// Starting delay for the backoff curve.
    pub base_delay: Duration,
    /// Multiplier for exponential backoff (must be > 0).
    pub backoff_factor: f64,
    /// Hard cap on any computed delay (must be ≥ `base_delay`).
    pub max_delay: Duration,
    /// Whether ±10% jitter is applied to de-synchronize concurrent retriers.
    pub jitter_enabled: bool,
    /// Which backoff curve to use.
    pub backoff: BackoffKind,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_enabled: true,
            backoff: BackoffKind::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Validate the policy fields.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }
        if self.backoff_factor <= 0.0 {
            return Err(ConfigError::invalid("backoff_factor must be greater than 0"));
        }
        if self.base_delay.is_zero() {
            return Err(ConfigError::invalid("base_delay must be greater than 0"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid(format!(
                "max_delay ({:?}) cannot be less than base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        Ok(())
    }

    /// Compute the un-jittered delay for a 0-based attempt index, clamped
    /// to `max_delay`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let computed_ms = match self.backoff {
            BackoffKind::Fixed => base_ms,
            BackoffKind::Linear => base_ms * (attempt as f64 + 1.0),
            BackoffKind::Exponential => {
                base_ms * self.backoff_factor.powi(attempt.min(MAX_BACKOFF_EXPONENT) as i32)
            }
            BackoffKind::Custom(f) => f(attempt).as_millis() as f64,
        };
        let capped_ms = computed_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Compute the delay for a 0-based attempt index, with jitter applied
    /// when enabled.
    ///
    /// Jitter is symmetric ±10% of the clamped delay and the result never
    /// drops below [`MIN_DELAY`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if !self.jitter_enabled {
            return raw;
        }

        let raw_ms = raw.as_millis() as f64;
        let spread = raw_ms * JITTER_RATIO;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        let jittered_ms = (raw_ms + jitter).max(MIN_DELAY.as_millis() as f64);
        Duration::from_millis(jittered_ms as u64)
    }
}

/// Builder for [`RetryPolicy`] with validation at `build()`.
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.policy.backoff_factor = factor;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter_enabled = enabled;
        self
    }

    pub fn fixed_backoff(mut self) -> Self {
        self.policy.backoff = BackoffKind::Fixed;
        self
    }

    pub fn linear_backoff(mut self) -> Self {
        self.policy.backoff = BackoffKind::Linear;
        self
    }

    pub fn exponential_backoff(mut self) -> Self {
        self.policy.backoff = BackoffKind::Exponential;
        self
    }

    pub fn custom_backoff(mut self, f: fn(u32) -> Duration) -> Self {
        self.policy.backoff = BackoffKind::Custom(f);
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Stock policies for common transport shapes.
pub struct RetryPolicies;

impl RetryPolicies {
    /// Short budget for interactive calls where a user is waiting.
    pub fn interactive() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
            jitter_enabled: true,
            backoff: BackoffKind::Exponential,
        }
    }

    /// Patient budget for unattended bulk synchronization.
    pub fn bulk_sync() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 8,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(120),
            jitter_enabled: true,
            backoff: BackoffKind::Exponential,
        }
    }

    /// Flat long delays for endpoints known to throttle aggressively.
    pub fn rate_limited() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: RATE_LIMIT_FLOOR_DELAY,
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(60),
            jitter_enabled: true,
            backoff: BackoffKind::Fixed,
        }
    }
}

/// Key for an operation-and-class specific rule.
type RuleKey = (String, ErrorClass);

/// Resolves the effective retry policy for an `(operation, error class)`
/// pair via cascading fallback.
///
/// Owned by the composition root and shared by reference; rules are fixed
/// after construction (no live reconfiguration mid-operation).
#[derive(Debug, Default)]
pub struct PolicyResolver {
    by_operation_and_class: HashMap<RuleKey, RetryPolicy>,
    by_operation: HashMap<String, RetryPolicy>,
    default_policy: Option<RetryPolicy>,
}

impl PolicyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The hard-coded safety net used when no configuration matches.
    pub fn fallback_policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Register a rule for a specific operation and error class.
    pub fn with_rule(
        mut self,
        operation: impl Into<String>,
        class: ErrorClass,
        policy: RetryPolicy,
    ) -> Self {
        self.by_operation_and_class.insert((operation.into(), class), policy);
        self
    }

    /// Register a rule for an operation regardless of error class.
    pub fn with_operation_policy(
        mut self,
        operation: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        self.by_operation.insert(operation.into(), policy);
        self
    }

    /// Register the global default policy.
    pub fn with_default(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    /// Resolve the effective policy. Never fails; the cascade ends at the
    /// hard-coded fallback.
    pub fn resolve(&self, operation: &str, class: Option<ErrorClass>) -> RetryPolicy {
        if let Some(class) = class {
            if let Some(policy) = self.by_operation_and_class.get(&(operation.to_string(), class)) {
                debug!(operation, %class, "resolved operation+class retry policy");
                return policy.clone();
            }
        }

        if let Some(policy) = self.by_operation.get(operation) {
            debug!(operation, "resolved operation-level retry policy");
            return policy.clone();
        }

        if let Some(policy) = &self.default_policy {
            return policy.clone();
        }

        Self::fallback_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates the exponential backoff curve.
    ///
    /// Assertions:
    /// - Confirms `raw_delay(n)` equals `base * factor^n` below the cap.
    /// - Confirms delays are clamped to `max_delay`.
    #[test]
    fn test_exponential_backoff_curve() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_secs(1))
            .backoff_factor(2.0)
            .max_delay(Duration::from_secs(30))
            .jitter(false)
            .build()
            .unwrap();

        assert_eq!(policy.raw_delay(0), Duration::from_secs(1));
        assert_eq!(policy.raw_delay(1), Duration::from_secs(2));
        assert_eq!(policy.raw_delay(2), Duration::from_secs(4));
        assert_eq!(policy.raw_delay(3), Duration::from_secs(8));

        // Attempt 10 would be 1024s without the clamp.
        assert_eq!(policy.raw_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_linear_backoff_curve() {
        let policy = RetryPolicy::builder()
            .linear_backoff()
            .base_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(10))
            .jitter(false)
            .build()
            .unwrap();

        assert_eq!(policy.raw_delay(0), Duration::from_millis(500));
        assert_eq!(policy.raw_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.raw_delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_fixed_backoff_curve() {
        let policy = RetryPolicy::builder()
            .fixed_backoff()
            .base_delay(Duration::from_secs(3))
            .jitter(false)
            .build()
            .unwrap();

        assert_eq!(policy.raw_delay(0), Duration::from_secs(3));
        assert_eq!(policy.raw_delay(9), Duration::from_secs(3));
    }

    #[test]
    fn test_custom_backoff_curve() {
        let policy = RetryPolicy::builder()
            .custom_backoff(|attempt| Duration::from_millis((attempt as u64 + 1) * 10))
            .base_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(25))
            .jitter(false)
            .build()
            .unwrap();

        assert_eq!(policy.raw_delay(0), Duration::from_millis(10));
        assert_eq!(policy.raw_delay(1), Duration::from_millis(20));
        // Clamp still applies to custom curves.
        assert_eq!(policy.raw_delay(5), Duration::from_millis(25));
    }

    /// Jittered delays must stay within ±10% of the clamped value and
    /// never go negative.
    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(10))
            .jitter(true)
            .build()
            .unwrap();

        for attempt in 0..5 {
            let raw = policy.raw_delay(attempt);
            let jittered = policy.delay_for(attempt);
            let lower = raw.mul_f64(1.0 - JITTER_RATIO - 0.001);
            let upper = raw.mul_f64(1.0 + JITTER_RATIO + 0.001);
            assert!(
                jittered >= lower && jittered <= upper,
                "jittered {jittered:?} outside [{lower:?}, {upper:?}]"
            );
        }
    }

    #[test]
    fn test_jitter_never_below_floor() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(100))
            .jitter(true)
            .build()
            .unwrap();

        for _ in 0..50 {
            assert!(policy.delay_for(0) >= MIN_DELAY);
        }
    }

    #[test]
    fn test_jitter_varies_delays() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(10))
            .jitter(true)
            .build()
            .unwrap();

        let delays: Vec<_> = (0..8).map(|_| policy.delay_for(0)).collect();
        let all_same = delays.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_same, "jitter should perturb delays");
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::builder().max_attempts(0).build().is_err());
        assert!(RetryPolicy::builder().backoff_factor(0.0).build().is_err());
        assert!(RetryPolicy::builder()
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(5))
            .build()
            .is_err());
        assert!(RetryPolicy::builder().build().is_ok());
    }

    #[test]
    fn test_default_policy_matches_safety_net() {
        let policy = PolicyResolver::fallback_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.backoff_factor, 2.0);
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!(policy.jitter_enabled);
    }

    /// Validates the cascading resolution order: exact, then operation,
    /// then default, then fallback.
    #[test]
    fn test_resolver_cascade() {
        let exact = RetryPolicy::builder().max_attempts(9).build().unwrap();
        let by_op = RetryPolicy::builder().max_attempts(7).build().unwrap();
        let default = RetryPolicy::builder().max_attempts(5).build().unwrap();

        let resolver = PolicyResolver::new()
            .with_rule("order.push", ErrorClass::RateLimited, exact)
            .with_operation_policy("order.push", by_op)
            .with_default(default);

        // Exact (operation, class) match wins.
        let p = resolver.resolve("order.push", Some(ErrorClass::RateLimited));
        assert_eq!(p.max_attempts, 9);

        // Different class falls through to the operation-level rule.
        let p = resolver.resolve("order.push", Some(ErrorClass::RetryableTransport));
        assert_eq!(p.max_attempts, 7);

        // Unknown operation falls through to the default.
        let p = resolver.resolve("customer.pull", None);
        assert_eq!(p.max_attempts, 5);
    }

    #[test]
    fn test_resolver_empty_uses_fallback() {
        let resolver = PolicyResolver::new();
        let p = resolver.resolve("anything", Some(ErrorClass::RetryableTransport));
        assert_eq!(p, PolicyResolver::fallback_policy());
    }

    #[test]
    fn test_stock_policies_are_valid() {
        assert!(RetryPolicies::interactive().validate().is_ok());
        assert!(RetryPolicies::bulk_sync().validate().is_ok());
        assert!(RetryPolicies::rate_limited().validate().is_ok());
    }
}
