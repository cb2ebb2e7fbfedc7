//! Engine configuration
//!
//! [`ReconConfig`] groups the tunables of every component. Each section has a
//! `Default` matching the values in [`constants`], and the whole structure can
//! be deserialized (with missing fields defaulted) when the `serde` feature is
//! enabled.
//!
//! ```rust
//! use std::time::Duration;
//! use bacnet_recon::config::ReconConfig;
//!
//! let mut config = ReconConfig::default();
//! config.pacing.concurrency = 1;
//! config.retry.backoff = Duration::from_millis(500);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::device::InstanceRange;

/// Default values
pub mod constants {
    use std::time::Duration;

    pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(10);
    pub const DEFAULT_INTER_RANGE_DELAY: Duration = Duration::from_secs(2);
    pub const DEFAULT_LOCATE_WINDOW: Duration = Duration::from_secs(3);
    pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

    /// Ranges swept when the caller gives none
    pub const COMMON_RANGES: [(u32, u32); 5] = [
        (1, 100),
        (100, 1000),
        (1000, 10000),
        (100000, 100100),
        (400000, 400100),
    ];

    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(300);
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    pub const DEFAULT_SPACING: Duration = Duration::from_millis(75);
    pub const MIN_SPACING: Duration = Duration::from_millis(50);
    pub const MAX_SPACING: Duration = Duration::from_millis(500);
    pub const DEFAULT_LATENCY_FACTOR: f64 = 0.5;
    pub const DEFAULT_CONCURRENCY: usize = 3;
    pub const DEFAULT_SHARD_COUNT: usize = 16;

    pub const DEFAULT_LATENCY_SAMPLES: u32 = 10;
    pub const SLOW_DEVICE_THRESHOLD: Duration = Duration::from_secs(1);

    pub const DEFAULT_THROTTLE_EVERY: u32 = 10;
    pub const DEFAULT_THROTTLE_PAUSE: Duration = Duration::from_millis(50);
    pub const DEFAULT_UNKNOWN_SIZE_CAP: u32 = 500;
    pub const DEFAULT_MAX_REPORTED_SIZE: u32 = 10_000;
    pub const DEFAULT_CONSECUTIVE_FAILURE_LIMIT: u32 = 10;

    pub const DEFAULT_WORKER_POOL_SIZE: usize = 1;
}

/// Result type for configuration checks
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors found by [`ReconConfig::validate`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("pacing spacing bounds are inverted: min {min:?} > max {max:?}")]
    SpacingBounds { min: Duration, max: Duration },
    #[error("pacing.latency_factor must be a finite non-negative number")]
    LatencyFactor,
}

/// Discovery settings
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DiscoveryConfig {
    /// How long a discovery call listens for announcements
    pub window: Duration,
    /// Pause between ranged Who-Is requests of a sweep
    pub inter_range_delay: Duration,
    /// Listening window of a targeted single-instance lookup
    pub locate_window: Duration,
    /// Capacity of the announcement queues fed by listener callbacks
    pub event_queue_capacity: usize,
    /// Ranges swept when none are given
    pub sweep_ranges: Vec<InstanceRange>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            window: constants::DEFAULT_DISCOVERY_WINDOW,
            inter_range_delay: constants::DEFAULT_INTER_RANGE_DELAY,
            locate_window: constants::DEFAULT_LOCATE_WINDOW,
            event_queue_capacity: constants::DEFAULT_EVENT_QUEUE_CAPACITY,
            sweep_ranges: common_ranges(),
        }
    }
}

/// The instance ranges most installations number their devices in
pub fn common_ranges() -> Vec<InstanceRange> {
    constants::COMMON_RANGES
        .iter()
        .filter_map(|&(low, high)| InstanceRange::new(low, high).ok())
        .collect()
}

/// Retry policy shared by every request the engine issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryPolicy {
    /// Attempts per request, first one included
    pub max_attempts: u32,
    /// Fixed pause before each retry
    pub backoff: Duration,
    /// Deadline of a single attempt
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_MAX_ATTEMPTS,
            backoff: constants::DEFAULT_BACKOFF,
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Per-device request pacing
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PacingConfig {
    /// Spacing between request starts before a device has been probed
    pub base_spacing: Duration,
    pub min_spacing: Duration,
    pub max_spacing: Duration,
    /// Tuned spacing is this share of the measured mean latency
    pub latency_factor: f64,
    /// Requests in flight per device
    pub concurrency: usize,
    /// Lock stripes for per-device state
    pub shard_count: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            base_spacing: constants::DEFAULT_SPACING,
            min_spacing: constants::MIN_SPACING,
            max_spacing: constants::MAX_SPACING,
            latency_factor: constants::DEFAULT_LATENCY_FACTOR,
            concurrency: constants::DEFAULT_CONCURRENCY,
            shard_count: constants::DEFAULT_SHARD_COUNT,
        }
    }
}

/// Capability probe settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProbeConfig {
    /// Sequential reads timed for the latency estimate
    pub latency_samples: u32,
    /// Mean latency above which a device is reported as slow
    pub slow_threshold: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            latency_samples: constants::DEFAULT_LATENCY_SAMPLES,
            slow_threshold: constants::SLOW_DEVICE_THRESHOLD,
        }
    }
}

/// Object-list enumeration settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EnumerationConfig {
    /// Pause after every this many indexed reads
    pub throttle_every: u32,
    pub throttle_pause: Duration,
    /// Highest index tried when the list size is unknown
    pub unknown_size_cap: u32,
    /// Highest index read when the list size is known; larger reported
    /// sizes are treated as bogus and cut down to it
    pub max_reported_size: u32,
    /// Consecutive failures that end a size-unknown scan
    pub consecutive_failure_limit: u32,
    /// Some devices count element 0 in the size they report
    pub size_includes_index_zero: bool,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            throttle_every: constants::DEFAULT_THROTTLE_EVERY,
            throttle_pause: constants::DEFAULT_THROTTLE_PAUSE,
            unknown_size_cap: constants::DEFAULT_UNKNOWN_SIZE_CAP,
            max_reported_size: constants::DEFAULT_MAX_REPORTED_SIZE,
            consecutive_failure_limit: constants::DEFAULT_CONSECUTIVE_FAILURE_LIMIT,
            size_includes_index_zero: false,
        }
    }
}

/// Notification worker pool settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WorkerConfig {
    pub pool_size: usize,
    /// Probe and enumerate every newly announced device
    pub auto_survey: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: constants::DEFAULT_WORKER_POOL_SIZE,
            auto_survey: true,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReconConfig {
    pub discovery: DiscoveryConfig,
    pub retry: RetryPolicy,
    pub pacing: PacingConfig,
    pub probe: ProbeConfig,
    pub enumeration: EnumerationConfig,
    pub workers: WorkerConfig,
}

impl ReconConfig {
    /// Check the values that would otherwise stall or panic the engine
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            (self.retry.max_attempts as usize, "retry.max_attempts"),
            (self.pacing.concurrency, "pacing.concurrency"),
            (self.pacing.shard_count, "pacing.shard_count"),
            (self.discovery.event_queue_capacity, "discovery.event_queue_capacity"),
            (self.workers.pool_size, "workers.pool_size"),
            (
                self.enumeration.consecutive_failure_limit as usize,
                "enumeration.consecutive_failure_limit",
            ),
            (
                self.enumeration.max_reported_size as usize,
                "enumeration.max_reported_size",
            ),
        ];
        if let Some(&(_, field)) = non_zero.iter().find(|(value, _)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }
        if self.retry.request_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "retry.request_timeout",
            });
        }
        if self.pacing.min_spacing > self.pacing.max_spacing {
            return Err(ConfigError::SpacingBounds {
                min: self.pacing.min_spacing,
                max: self.pacing.max_spacing,
            });
        }
        if !self.pacing.latency_factor.is_finite() || self.pacing.latency_factor < 0.0 {
            return Err(ConfigError::LatencyFactor);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReconConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff, Duration::from_millis(300));
        assert_eq!(config.pacing.base_spacing, Duration::from_millis(75));
        assert_eq!(config.pacing.concurrency, 3);
        assert_eq!(config.discovery.inter_range_delay, Duration::from_secs(2));
        assert_eq!(config.discovery.sweep_ranges.len(), 5);
        assert_eq!(config.enumeration.unknown_size_cap, 500);
        assert_eq!(config.enumeration.max_reported_size, 10_000);
        assert!(!config.enumeration.size_includes_index_zero);
        assert_eq!(config.workers.pool_size, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ReconConfig::default();
        config.pacing.concurrency = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "pacing.concurrency"
            })
        );

        let mut config = ReconConfig::default();
        config.pacing.min_spacing = Duration::from_secs(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SpacingBounds { .. })
        ));

        let mut config = ReconConfig::default();
        config.pacing.latency_factor = f64::NAN;
        assert_eq!(config.validate(), Err(ConfigError::LatencyFactor));
    }

    #[test]
    fn test_common_ranges_are_ordered_as_listed() {
        let ranges = common_ranges();
        assert_eq!(ranges[0].low(), 1);
        assert_eq!(ranges[4].high(), 400100);
    }
}
