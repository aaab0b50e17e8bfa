//! # Runtime Configuration Module
//!
//! Scheduler and coroutine settings, loaded from defaults, an optional YAML
//! document and environment overrides (in that order).
//!
//! ## Environment Variables
//!
//! - `COROUTER_WORKERS`: number of `may` worker threads (default: 4)
//! - `COROUTER_STACK_SIZE`: coroutine stack size, decimal or `0x` hex (default: `0x10000`)
//! - `COROUTER_START_POLICY`: `eager`/`immediate` or `lazy`/`deferred` (default: `eager`)
//! - `COROUTER_TASK_DEADLINE_MS`: cancel tasks still running after this long (default: none)
//! - `COROUTER_SHUTDOWN_GRACE_MS`: how long `shutdown` waits for tasks to drain (default: 5000)
//!
//! ## Example
//!
//! ```yaml
//! workers: 8
//! stack_size: 0x8000
//! start_policy: lazy
//! task_deadline_ms: 2000
//! ```

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// When the body of a launched task starts running relative to `launch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    /// `launch` returns once the body first suspends or completes.
    #[default]
    #[serde(alias = "immediate")]
    Eager,
    /// `launch` returns as soon as the coroutine has been spawned.
    #[serde(alias = "deferred")]
    Lazy,
}

impl StartPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "eager" | "immediate" => Some(Self::Eager),
            "lazy" | "deferred" => Some(Self::Lazy),
            _ => None,
        }
    }
}

/// Runtime configuration for the [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads backing the coroutine runtime
    pub workers: usize,
    /// Stack size for task coroutines in bytes
    pub stack_size: usize,
    pub start_policy: StartPolicy,
    /// Per-task deadline; `None` disables the watchdog
    pub task_deadline_ms: Option<u64>,
    pub shutdown_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            stack_size: 0x10000,
            start_policy: StartPolicy::Eager,
            task_deadline_ms: None,
            shutdown_grace_ms: 5_000,
        }
    }
}

fn parse_size(val: &str) -> Option<usize> {
    match val.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => val.parse().ok(),
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `COROUTER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Parse a YAML document; missing keys keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("invalid runtime configuration")
    }

    /// Load a YAML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading runtime configuration {}", path.display()))?;
        let mut config = Self::from_yaml_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    /// Overlay environment variables. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(workers) = env::var("COROUTER_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.workers = workers;
        }
        if let Some(size) = env::var("COROUTER_STACK_SIZE")
            .ok()
            .and_then(|s| parse_size(&s))
        {
            self.stack_size = size;
        }
        if let Some(policy) = env::var("COROUTER_START_POLICY")
            .ok()
            .and_then(|s| StartPolicy::parse(&s))
        {
            self.start_policy = policy;
        }
        if let Ok(val) = env::var("COROUTER_TASK_DEADLINE_MS") {
            self.task_deadline_ms = val.parse().ok().filter(|ms| *ms > 0);
        }
        if let Some(grace) = env::var("COROUTER_SHUTDOWN_GRACE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.shutdown_grace_ms = grace;
        }
    }

    pub fn task_deadline(&self) -> Option<Duration> {
        self.task_deadline_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Push worker count and stack size into the `may` runtime.
    ///
    /// Only effective before the first coroutine is spawned.
    pub fn apply_runtime(&self) {
        may::config()
            .set_workers(self.workers)
            .set_stack_size(self.stack_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_policy_parse() {
        assert_eq!(StartPolicy::parse("eager"), Some(StartPolicy::Eager));
        assert_eq!(StartPolicy::parse("Immediate"), Some(StartPolicy::Eager));
        assert_eq!(StartPolicy::parse("LAZY"), Some(StartPolicy::Lazy));
        assert_eq!(StartPolicy::parse("deferred"), Some(StartPolicy::Lazy));
        assert_eq!(StartPolicy::parse("sometimes"), None);
    }

    #[test]
    fn test_parse_size_accepts_hex_and_decimal() {
        assert_eq!(parse_size("0x8000"), Some(0x8000));
        assert_eq!(parse_size("32768"), Some(32768));
        assert_eq!(parse_size("big"), None);
    }

    #[test]
    fn test_yaml_keeps_defaults_for_missing_keys() {
        let config = RuntimeConfig::from_yaml_str("start_policy: deferred\ntask_deadline_ms: 250\n")
            .unwrap();
        assert_eq!(config.start_policy, StartPolicy::Lazy);
        assert_eq!(config.task_deadline(), Some(Duration::from_millis(250)));
        assert_eq!(config.workers, 4);
        assert_eq!(config.stack_size, 0x10000);
    }

    #[test]
    fn test_yaml_rejects_unknown_policy() {
        assert!(RuntimeConfig::from_yaml_str("start_policy: whenever\n").is_err());
    }
}
