//! Memory-pressure resource governor
//!
//! Long-running bulk sync jobs accumulate pending work in memory; on small
//! deployments that can climb into OOM territory. The governor maps the
//! current process footprint onto graduated pressure levels and advises the
//! pipeline: shrink batches, pause intake, or abort the operation cleanly
//! before the OS kills it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult};

/// Largest sampling interval `check_interval` will return.
pub const MAX_CHECK_INTERVAL: u64 = 50;

/// Graduated memory pressure levels, ordered by severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    /// Below the warning threshold; run at full batch size.
    Healthy,
    /// Above warning; halve batches and stop taking new work.
    Warning,
    /// Above cleanup; shrink batches hard and release caches.
    Cleanup,
    /// Above critical; abort in-flight operations cleanly.
    Critical,
}

impl MemoryPressure {
    /// Batch scale factor the pipeline should apply at this level.
    pub fn batch_scale(self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Warning => 0.5,
            Self::Cleanup | Self::Critical => 0.3,
        }
    }
}

impl std::fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Cleanup => write!(f, "cleanup"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Point-in-time memory reading from a [`MemoryProbe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MemoryStatsSnapshot {
    /// Resident set of the process, in bytes.
    pub current_bytes: u64,
    /// Highest reading the probe has observed, in bytes.
    pub peak_bytes: u64,
    /// Configured ceiling the governor measures against, in bytes.
    pub limit_bytes: u64,
    /// Headroom left under the raw limit, in bytes.
    pub available_bytes: u64,
}

impl MemoryStatsSnapshot {
    pub fn new(current_bytes: u64, peak_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            current_bytes,
            peak_bytes: peak_bytes.max(current_bytes),
            limit_bytes,
            available_bytes: limit_bytes.saturating_sub(current_bytes),
        }
    }
}

/// Source of memory readings. Object-safe so the governor can hold a
/// trait object and tests can substitute fixed readings.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemoryStatsSnapshot;
}

/// Probe returning a fixed reading; tests mutate it between samples.
#[derive(Debug)]
pub struct StaticMemoryProbe {
    current_bytes: std::sync::atomic::AtomicU64,
    peak_bytes: std::sync::atomic::AtomicU64,
    limit_bytes: u64,
}

impl StaticMemoryProbe {
    pub fn new(current_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            current_bytes: std::sync::atomic::AtomicU64::new(current_bytes),
            peak_bytes: std::sync::atomic::AtomicU64::new(current_bytes),
            limit_bytes,
        }
    }

    pub fn set_current(&self, bytes: u64) {
        self.current_bytes.store(bytes, Ordering::Relaxed);
        self.peak_bytes.fetch_max(bytes, Ordering::Relaxed);
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn sample(&self) -> MemoryStatsSnapshot {
        MemoryStatsSnapshot::new(
            self.current_bytes.load(Ordering::Relaxed),
            self.peak_bytes.load(Ordering::Relaxed),
            self.limit_bytes,
        )
    }
}

/// Deployment tier; selects the default threshold ratios.
///
/// Development boxes share memory with everything else on the machine, so
/// thresholds are conservative. Production gets the most headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    #[default]
    Production,
}

impl Environment {
    /// `(warning, cleanup, critical, buffer)` ratios for this tier.
    fn ratios(self) -> (f64, f64, f64, f64) {
        match self {
            Self::Development => (0.50, 0.60, 0.70, 0.80),
            Self::Staging => (0.60, 0.70, 0.80, 0.85),
            Self::Production => (0.70, 0.80, 0.90, 0.90),
        }
    }
}

/// Governor tuning knobs. Thresholds are ratios of the effective limit.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorConfig {
    /// Hard memory ceiling in bytes.
    pub limit_bytes: u64,
    /// Usage ratio at which pressure becomes `Warning`.
    pub warning_ratio: f64,
    /// Usage ratio at which pressure becomes `Cleanup`.
    pub cleanup_ratio: f64,
    /// Usage ratio at which pressure becomes `Critical`.
    pub critical_ratio: f64,
    /// Fraction of `limit_bytes` treated as usable; the rest is headroom
    /// for allocator slack and burst allocations.
    pub buffer_ratio: f64,
}

impl GovernorConfig {
    /// Config with tier-default ratios for the given environment.
    pub fn for_environment(environment: Environment, limit_bytes: u64) -> Self {
        let (warning_ratio, cleanup_ratio, critical_ratio, buffer_ratio) = environment.ratios();
        Self { limit_bytes, warning_ratio, cleanup_ratio, critical_ratio, buffer_ratio }
    }

    pub fn builder(limit_bytes: u64) -> GovernorConfigBuilder {
        GovernorConfigBuilder::new(limit_bytes)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.limit_bytes == 0 {
            return Err(ConfigError::invalid("limit_bytes must be greater than 0"));
        }
        for (name, ratio) in [
            ("warning_ratio", self.warning_ratio),
            ("cleanup_ratio", self.cleanup_ratio),
            ("critical_ratio", self.critical_ratio),
            ("buffer_ratio", self.buffer_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) || ratio == 0.0 {
                return Err(ConfigError::invalid(format!(
                    "{name} must be within (0, 1], got {ratio}"
                )));
            }
        }
        if !(self.warning_ratio < self.cleanup_ratio && self.cleanup_ratio < self.critical_ratio) {
            return Err(ConfigError::invalid(format!(
                "thresholds must be ordered warning < cleanup < critical, got {} / {} / {}",
                self.warning_ratio, self.cleanup_ratio, self.critical_ratio
            )));
        }
        Ok(())
    }

    /// The usable ceiling after the buffer is reserved.
    fn effective_limit_bytes(&self) -> f64 {
        self.limit_bytes as f64 * self.buffer_ratio
    }
}

/// Builder for [`GovernorConfig`] starting from production-tier defaults.
#[derive(Debug)]
pub struct GovernorConfigBuilder {
    config: GovernorConfig,
}

impl GovernorConfigBuilder {
    pub fn new(limit_bytes: u64) -> Self {
        Self { config: GovernorConfig::for_environment(Environment::Production, limit_bytes) }
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        let limit = self.config.limit_bytes;
        self.config = GovernorConfig::for_environment(environment, limit);
        self
    }

    pub fn warning_ratio(mut self, ratio: f64) -> Self {
        self.config.warning_ratio = ratio;
        self
    }

    pub fn cleanup_ratio(mut self, ratio: f64) -> Self {
        self.config.cleanup_ratio = ratio;
        self
    }

    pub fn critical_ratio(mut self, ratio: f64) -> Self {
        self.config.critical_ratio = ratio;
        self
    }

    pub fn buffer_ratio(mut self, ratio: f64) -> Self {
        self.config.buffer_ratio = ratio;
        self
    }

    pub fn build(self) -> ConfigResult<GovernorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Maps memory usage onto pressure levels and batch-size advice.
///
/// Sampling the probe is cheap but not free; callers use
/// [`ResourceGovernor::check_interval`] to decide how often to sample
/// inside per-item loops.
pub struct ResourceGovernor {
    config: GovernorConfig,
    probe: Arc<dyn MemoryProbe>,
    /// Last observed level, for transition logging only.
    last_level: AtomicU8,
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config,
            probe,
            last_level: AtomicU8::new(MemoryPressure::Healthy as u8),
        }
    }

    /// Current usage as a fraction of the effective (buffered) limit.
    pub fn usage_ratio(&self) -> f64 {
        let snapshot = self.probe.sample();
        snapshot.current_bytes as f64 / self.config.effective_limit_bytes()
    }

    /// Sample the probe and classify the current pressure level.
    ///
    /// Level transitions are logged; steady-state checks are silent.
    pub fn current_pressure(&self) -> MemoryPressure {
        let ratio = self.usage_ratio();
        let level = if ratio >= self.config.critical_ratio {
            MemoryPressure::Critical
        } else if ratio >= self.config.cleanup_ratio {
            MemoryPressure::Cleanup
        } else if ratio >= self.config.warning_ratio {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Healthy
        };

        let previous = self.last_level.swap(level as u8, Ordering::Relaxed);
        if previous != level as u8 {
            match level {
                MemoryPressure::Healthy => {
                    info!(usage_ratio = ratio, "memory pressure back to healthy");
                }
                MemoryPressure::Warning => {
                    warn!(usage_ratio = ratio, "memory pressure warning, halving batches");
                }
                MemoryPressure::Cleanup => {
                    warn!(usage_ratio = ratio, "memory pressure cleanup, shrinking batches");
                }
                MemoryPressure::Critical => {
                    warn!(usage_ratio = ratio, "memory pressure critical, aborting operations");
                }
            }
        } else {
            debug!(usage_ratio = ratio, level = %level, "memory pressure sampled");
        }
        level
    }

    /// Scale a configured batch size for the current pressure, never
    /// dropping below `min_batch_size`.
    pub fn adjust_batch_size(&self, configured: u64, min_batch_size: u64) -> u64 {
        let scaled = (configured as f64 * self.current_pressure().batch_scale()) as u64;
        scaled.max(min_batch_size)
    }

    /// Whether the pipeline should stop taking new work and drain.
    pub fn should_stop_gracefully(&self) -> bool {
        self.current_pressure() >= MemoryPressure::Warning
    }

    /// Whether in-flight operations must abort now, preserving partial
    /// results.
    pub fn should_stop_for_critical_memory(&self) -> bool {
        self.current_pressure() >= MemoryPressure::Critical
    }

    /// The most recent probe reading, for metrics snapshots.
    pub fn sample(&self) -> MemoryStatsSnapshot {
        self.probe.sample()
    }

    /// How many processed items may pass between pressure checks.
    ///
    /// Small batches check every item; larger batches check roughly ten
    /// times per batch, capped at [`MAX_CHECK_INTERVAL`].
    pub fn check_interval(&self, batch_size: u64) -> u64 {
        if batch_size <= 10 {
            1
        } else {
            (batch_size / 10).clamp(1, MAX_CHECK_INTERVAL)
        }
    }
}
