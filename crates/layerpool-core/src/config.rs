//! Dispatcher configuration.
//!
//! Loaded from TOML (every field optional), then overridden from the
//! environment, then validated.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Priority, TaskOptions};
use crate::error::DispatchError;
use crate::pool::detect_cpu_count;

/// Upper bound accepted for `cpu_count`.
pub const MAX_CPU_COUNT: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Concurrent dispatch loop instances sharing the queue.
    pub dispatch_loops: usize,
    /// Capacity basis for pool sizing and the upper bound of `scale_layer`.
    pub cpu_count: usize,
    pub default_priority: Priority,
    pub default_timeout_ms: u64,
    pub default_max_retries: u32,
    /// Grace period used by `Dispatcher::shutdown_default`.
    pub shutdown_grace_ms: u64,
    pub completed_history: usize,
    pub failed_history: usize,
    pub throughput_window_ms: u64,
    /// Buffer of the broadcast channel behind `Dispatcher::subscribe`.
    pub event_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatch_loops: 4,
            cpu_count: detect_cpu_count(),
            default_priority: Priority::Medium,
            default_timeout_ms: 30_000,
            default_max_retries: 2,
            shutdown_grace_ms: 30_000,
            completed_history: 1000,
            failed_history: 1000,
            throughput_window_ms: 1000,
            event_capacity: 1024,
        }
    }
}

/// Resolved per-task settings, after falling back to config defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub priority: Priority,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl DispatcherConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, DispatchError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DispatchError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `LAYERPOOL_DISPATCH_LOOPS` -> `dispatch_loops`
    /// - `LAYERPOOL_CPU_COUNT` -> `cpu_count`
    /// - `LAYERPOOL_DEFAULT_TIMEOUT_MS` -> `default_timeout_ms`
    /// - `LAYERPOOL_SHUTDOWN_GRACE_MS` -> `shutdown_grace_ms`
    ///
    /// Unparsable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn read<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparsable override");
                    None
                }
            }
        }

        if let Some(v) = read(&lookup, "LAYERPOOL_DISPATCH_LOOPS") {
            self.dispatch_loops = v;
        }
        if let Some(v) = read(&lookup, "LAYERPOOL_CPU_COUNT") {
            self.cpu_count = v;
        }
        if let Some(v) = read(&lookup, "LAYERPOOL_DEFAULT_TIMEOUT_MS") {
            self.default_timeout_ms = v;
        }
        if let Some(v) = read(&lookup, "LAYERPOOL_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace_ms = v;
        }
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        let positive = [
            ("dispatch_loops", self.dispatch_loops),
            ("cpu_count", self.cpu_count),
            ("completed_history", self.completed_history),
            ("failed_history", self.failed_history),
            ("event_capacity", self.event_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DispatchError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.cpu_count > MAX_CPU_COUNT {
            return Err(DispatchError::Config(format!(
                "cpu_count must be at most {MAX_CPU_COUNT}"
            )));
        }
        if self.throughput_window_ms == 0 {
            return Err(DispatchError::Config(
                "throughput_window_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_millis(self.throughput_window_ms)
    }

    /// Fill unset options from the configured defaults.
    pub fn resolve(&self, options: TaskOptions) -> ResolvedOptions {
        ResolvedOptions {
            priority: options.priority.unwrap_or(self.default_priority),
            timeout: options.timeout.unwrap_or_else(|| self.default_timeout()),
            max_retries: options.max_retries.unwrap_or(self.default_max_retries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_follow_the_reference_dispatcher() {
        let config = DispatcherConfig::default();
        assert_eq!(config.dispatch_loops, 4);
        assert_eq!(config.default_priority, Priority::Medium);
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_max_retries, 2);
        assert_eq!(config.completed_history, 1000);
        assert!(config.cpu_count >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let mut config: DispatcherConfig = toml::from_str(
            r#"
            dispatch_loops = 2
            cpu_count = 16
            default_priority = "high"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.dispatch_loops, 2);
        assert_eq!(config.cpu_count, 16);
        assert_eq!(config.default_priority, Priority::High);
        assert_eq!(config.default_timeout_ms, 30_000);

        config.apply_overrides(|_| None);
        assert_eq!(config.cpu_count, 16);
    }

    #[test]
    fn unknown_priority_is_a_parse_error() {
        let err = DispatcherConfig::from_toml(r#"default_priority = "urgent""#).unwrap_err();
        assert!(matches!(err, DispatchError::ConfigParse(_)));
    }

    #[test]
    fn zero_values_fail_validation() {
        let config = DispatcherConfig {
            dispatch_loops: 0,
            ..DispatcherConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DispatchError::Config(msg)) if msg.contains("dispatch_loops")
        ));

        let config = DispatcherConfig {
            throughput_window_ms: 0,
            ..DispatcherConfig::default()
        };
        assert!(matches!(config.validate(), Err(DispatchError::Config(_))));
    }

    #[test]
    fn oversized_cpu_count_is_rejected() {
        let err = DispatcherConfig::from_toml("cpu_count = 100000000000000000").unwrap_err();
        assert!(matches!(err, DispatchError::Config(msg) if msg.contains("cpu_count")));

        let config = DispatcherConfig {
            cpu_count: MAX_CPU_COUNT,
            ..DispatcherConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LAYERPOOL_DISPATCH_LOOPS", "8"),
            ("LAYERPOOL_CPU_COUNT", "not-a-number"),
            ("LAYERPOOL_SHUTDOWN_GRACE_MS", " 500 "),
        ]);
        let mut config = DispatcherConfig {
            cpu_count: 4,
            ..DispatcherConfig::default()
        };
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.dispatch_loops, 8);
        assert_eq!(config.cpu_count, 4);
        assert_eq!(config.shutdown_grace(), Duration::from_millis(500));
        assert_eq!(config.default_timeout_ms, 30_000);
    }

    #[test]
    fn resolve_prefers_explicit_options() {
        let config = DispatcherConfig::default();
        let options = TaskOptions::new().priority(Priority::Critical).timeout_ms(5);
        let resolved = config.resolve(options);
        assert_eq!(resolved.priority, Priority::Critical);
        assert_eq!(resolved.timeout, Duration::from_millis(5));
        assert_eq!(resolved.max_retries, 2);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = DispatcherConfig::from_file("/nonexistent/layerpool.toml").unwrap_err();
        assert!(matches!(err, DispatchError::ConfigIo(_)));
    }
}
