//! # Bridge Configuration
//!
//! Settings for one async bridge lifecycle: how the scheduler loop is built,
//! how long shutdown may wait, and whether debug instrumentation is on.
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::BridgeConfig;
//! use std::time::Duration;
//!
//! let config = BridgeConfig::builder()
//!     .debug(true)
//!     .sweep_timeout(Duration::from_secs(5))
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.sweep_timeout, Some(Duration::from_secs(5)));
//! ```
//!
//! ## Error Handling
//!
//! The builder validates eagerly and returns actionable messages:
//!
//! ```should_panic
//! use core_runtime::config::BridgeConfig;
//! use std::time::Duration;
//!
//! // Timers are disabled, so a drain timeout can never fire.
//! let config = BridgeConfig::builder()
//!     .enable_time(false)
//!     .drain_timeout(Duration::from_secs(1))
//!     .build()
//!     .expect("Should fail - timeout without timer driver");
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable toggling debug instrumentation (`true`/`false`/`1`/`0`).
pub const ENV_DEBUG: &str = "CORE_BRIDGE_DEBUG";
/// Environment variable setting the drain timeout in milliseconds.
pub const ENV_DRAIN_TIMEOUT_MS: &str = "CORE_BRIDGE_DRAIN_TIMEOUT_MS";
/// Environment variable setting the sweep timeout in milliseconds.
pub const ENV_SWEEP_TIMEOUT_MS: &str = "CORE_BRIDGE_SWEEP_TIMEOUT_MS";

const MAX_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration for one bridge lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Trace every work item and warn about slow ones.
    ///
    /// Default: true.
    #[serde(default = "default_debug")]
    pub debug: bool,

    /// Work items running longer than this are reported in debug mode.
    ///
    /// Default: 100 ms.
    #[serde(default = "default_slow_phase_threshold")]
    pub slow_phase_threshold: Duration,

    /// Upper bound for draining the queue at shutdown. `None` waits for the
    /// last submitted item however long it takes.
    ///
    /// Default: None.
    #[serde(default)]
    pub drain_timeout: Option<Duration>,

    /// Upper bound for outstanding tasks to acknowledge cancellation.
    ///
    /// Default: None.
    #[serde(default)]
    pub sweep_timeout: Option<Duration>,

    /// How long closing the loop may wait for blocking work.
    ///
    /// Default: 1 second.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// Build the loop with the timer driver.
    ///
    /// Default: true.
    #[serde(default = "default_true")]
    pub enable_time: bool,

    /// Build the loop with the I/O driver.
    ///
    /// Default: true.
    #[serde(default = "default_true")]
    pub enable_io: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            debug: default_debug(),
            slow_phase_threshold: default_slow_phase_threshold(),
            drain_timeout: None,
            sweep_timeout: None,
            shutdown_timeout: default_shutdown_timeout(),
            enable_time: true,
            enable_io: true,
        }
    }
}

impl BridgeConfig {
    /// Creates a new builder starting from the defaults.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is malformed or the result
    /// fails [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid bridge config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `CORE_BRIDGE_*` environment overrides on top of this config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set but cannot be parsed, or
    /// if the resulting config is invalid.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_DEBUG) {
            self.debug = parse_bool(ENV_DEBUG, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DRAIN_TIMEOUT_MS) {
            self.drain_timeout = Some(parse_millis(ENV_DRAIN_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_SWEEP_TIMEOUT_MS) {
            self.sweep_timeout = Some(parse_millis(ENV_SWEEP_TIMEOUT_MS, &raw)?);
        }
        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration.
    ///
    /// This checks:
    /// - The slow-phase threshold is non-zero
    /// - Timeouts, when set, are non-zero
    /// - Timeouts are only set when the timer driver is enabled
    /// - The shutdown timeout does not exceed 5 minutes
    pub fn validate(&self) -> Result<()> {
        if self.slow_phase_threshold.is_zero() {
            return Err(Error::Config(
                "Slow phase threshold must be greater than 0".to_string(),
            ));
        }

        for (name, timeout) in [
            ("Drain timeout", self.drain_timeout),
            ("Sweep timeout", self.sweep_timeout),
        ] {
            let Some(timeout) = timeout else {
                continue;
            };
            if timeout.is_zero() {
                return Err(Error::Config(format!(
                    "{} must be greater than 0 when set",
                    name
                )));
            }
            if !self.enable_time {
                return Err(Error::Config(format!(
                    "{} requires the timer driver. Use .enable_time(true) or drop the timeout.",
                    name
                )));
            }
        }

        if self.shutdown_timeout > MAX_SHUTDOWN_TIMEOUT {
            return Err(Error::Config(
                "Shutdown timeout exceeds maximum of 5 minutes".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`BridgeConfig`].
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Enables or disables debug instrumentation.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the threshold above which a work item counts as slow.
    pub fn slow_phase_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_phase_threshold = threshold;
        self
    }

    /// Bounds the shutdown drain.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = Some(timeout);
        self
    }

    /// Bounds the cancellation sweep.
    pub fn sweep_timeout(mut self, timeout: Duration) -> Self {
        self.config.sweep_timeout = Some(timeout);
        self
    }

    /// Sets how long closing the loop may wait for blocking work.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Enables or disables the timer driver.
    pub fn enable_time(mut self, enabled: bool) -> Self {
        self.config.enable_time = enabled;
        self
    }

    /// Enables or disables the I/O driver.
    pub fn enable_io(mut self, enabled: bool) -> Self {
        self.config.enable_io = enabled;
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn build(self) -> Result<BridgeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn default_debug() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_slow_phase_threshold() -> Duration {
    Duration::from_millis(100)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(1)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| Error::Config(format!("{} must be milliseconds: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert!(config.debug);
        assert_eq!(config.slow_phase_threshold, Duration::from_millis(100));
        assert_eq!(config.drain_timeout, None);
        assert_eq!(config.sweep_timeout, None);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert!(config.enable_time);
        assert!(config.enable_io);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = BridgeConfig::builder()
            .debug(false)
            .slow_phase_threshold(Duration::from_millis(250))
            .drain_timeout(Duration::from_secs(2))
            .sweep_timeout(Duration::from_secs(3))
            .shutdown_timeout(Duration::from_millis(500))
            .enable_io(false)
            .build()
            .unwrap();

        assert!(!config.debug);
        assert_eq!(config.slow_phase_threshold, Duration::from_millis(250));
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.sweep_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(500));
        assert!(!config.enable_io);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = BridgeConfig::builder()
            .sweep_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Sweep timeout must be greater than 0"));
    }

    #[test]
    fn test_timeout_requires_timer_driver() {
        let err = BridgeConfig::builder()
            .enable_time(false)
            .drain_timeout(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("requires the timer driver"));
    }

    #[test]
    fn test_zero_slow_threshold_rejected() {
        let result = BridgeConfig::builder()
            .slow_phase_threshold(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_shutdown_timeout_cap() {
        let result = BridgeConfig::builder()
            .shutdown_timeout(Duration::from_secs(301))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config =
            BridgeConfig::from_json_str(r#"{"debug": false, "sweep_timeout": {"secs": 4, "nanos": 0}}"#)
                .unwrap();
        assert!(!config.debug);
        assert_eq!(config.sweep_timeout, Some(Duration::from_secs(4)));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert!(config.enable_time);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = BridgeConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let config = BridgeConfig::default()
            .with_overrides_from(lookup_from(&[
                (ENV_DEBUG, "off"),
                (ENV_DRAIN_TIMEOUT_MS, "1500"),
                (ENV_SWEEP_TIMEOUT_MS, " 20 "),
            ]))
            .unwrap();

        assert!(!config.debug);
        assert_eq!(config.drain_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.sweep_timeout, Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_env_overrides_absent_keep_config() {
        let base = BridgeConfig::builder().debug(false).build().unwrap();
        let config = base.clone().with_overrides_from(lookup_from(&[])).unwrap();
        assert_eq!(config, base);
    }

    #[test]
    fn test_env_override_parse_errors() {
        let err = BridgeConfig::default()
            .with_overrides_from(lookup_from(&[(ENV_DEBUG, "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_DEBUG));

        let err = BridgeConfig::default()
            .with_overrides_from(lookup_from(&[(ENV_DRAIN_TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_DRAIN_TIMEOUT_MS));
    }

    #[test]
    fn test_env_zero_timeout_fails_validation() {
        let result = BridgeConfig::default()
            .with_overrides_from(lookup_from(&[(ENV_SWEEP_TIMEOUT_MS, "0")]));
        assert!(result.is_err());
    }
}
