// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults can be overridden programmatically with the `with_*` setters
//! or from the environment:
//!
//! | variable                     | meaning                              |
//! |------------------------------|--------------------------------------|
//! | `SPINDLE_THREADS`            | worker threads (0 = available cores) |
//! | `SPINDLE_CONTEXT`            | `shared` or `pinned`                 |
//! | `SPINDLE_BLOCKING_POOL_SIZE` | max blocking-pool threads            |
//! | `SPINDLE_BLOCKING_IDLE_TTL`  | idle blocking thread lifetime, secs  |

use std::env;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::context::ContextMode;

pub const ENV_THREADS: &str = "SPINDLE_THREADS";
pub const ENV_CONTEXT: &str = "SPINDLE_CONTEXT";
pub const ENV_BLOCKING_POOL_SIZE: &str = "SPINDLE_BLOCKING_POOL_SIZE";
pub const ENV_BLOCKING_IDLE_TTL: &str = "SPINDLE_BLOCKING_IDLE_TTL";

const DEFAULT_BLOCKING_POOL_SIZE: usize = 128;
const DEFAULT_BLOCKING_IDLE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid value `{value}` for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker threads. Zero means one per available core.
    pub threads: usize,
    pub context: ContextMode,
    /// Upper bound on blocking-pool threads.
    pub blocking_pool_size: usize,
    /// How long an idle blocking thread lingers before exiting.
    pub blocking_pool_idle_ttl: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            context: ContextMode::Shared,
            blocking_pool_size: DEFAULT_BLOCKING_POOL_SIZE,
            blocking_pool_idle_ttl: DEFAULT_BLOCKING_IDLE_TTL,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `SPINDLE_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(threads) = parse_var(&lookup, ENV_THREADS)? {
            config.threads = threads;
        }
        if let Some(context) = parse_var(&lookup, ENV_CONTEXT)? {
            config.context = context;
        }
        if let Some(size) = parse_var::<usize>(&lookup, ENV_BLOCKING_POOL_SIZE)? {
            if size == 0 {
                return Err(ConfigError {
                    var: ENV_BLOCKING_POOL_SIZE,
                    value: size.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.blocking_pool_size = size;
        }
        if let Some(secs) = parse_var::<f64>(&lookup, ENV_BLOCKING_IDLE_TTL)? {
            config.blocking_pool_idle_ttl =
                Duration::try_from_secs_f64(secs).map_err(|e| ConfigError {
                    var: ENV_BLOCKING_IDLE_TTL,
                    value: secs.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(config)
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_context(mut self, context: ContextMode) -> Self {
        self.context = context;
        self
    }

    pub fn with_blocking_pool_size(mut self, size: usize) -> Self {
        self.blocking_pool_size = size.max(1);
        self
    }

    pub fn with_blocking_pool_idle_ttl(mut self, ttl: Duration) -> Self {
        self.blocking_pool_idle_ttl = ttl;
        self
    }

    /// Worker count with `0` resolved against the machine.
    pub fn worker_threads(&self) -> usize {
        if self.threads == 0 {
            thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.threads
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.threads, 0);
        assert_eq!(config.context, ContextMode::Shared);
        assert_eq!(config.blocking_pool_size, 128);
        assert_eq!(config.blocking_pool_idle_ttl, Duration::from_secs(30));
        assert!(config.worker_threads() >= 1);
    }

    #[test]
    fn env_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_THREADS, "3"),
            (ENV_CONTEXT, "pinned"),
            (ENV_BLOCKING_POOL_SIZE, "8"),
            (ENV_BLOCKING_IDLE_TTL, "0.5"),
        ]))
        .unwrap();
        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.context, ContextMode::Pinned);
        assert_eq!(config.blocking_pool_size, 8);
        assert_eq!(config.blocking_pool_idle_ttl, Duration::from_millis(500));
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = RuntimeConfig::from_lookup(lookup(&[(ENV_THREADS, "  ")])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn bad_values_are_reported() {
        let err = RuntimeConfig::from_lookup(lookup(&[(ENV_THREADS, "many")])).unwrap_err();
        assert_eq!(err.var, ENV_THREADS);
        assert_eq!(err.value, "many");

        let err =
            RuntimeConfig::from_lookup(lookup(&[(ENV_BLOCKING_POOL_SIZE, "0")])).unwrap_err();
        assert_eq!(err.var, ENV_BLOCKING_POOL_SIZE);

        let err =
            RuntimeConfig::from_lookup(lookup(&[(ENV_BLOCKING_IDLE_TTL, "-1")])).unwrap_err();
        assert_eq!(err.var, ENV_BLOCKING_IDLE_TTL);
    }

    #[test]
    fn builder_setters() {
        let config = RuntimeConfig::new()
            .with_threads(2)
            .with_context(ContextMode::Pinned)
            .with_blocking_pool_size(0)
            .with_blocking_pool_idle_ttl(Duration::from_secs(1));
        assert_eq!(config.threads, 2);
        assert_eq!(config.blocking_pool_size, 1);
        assert_eq!(config.blocking_pool_idle_ttl, Duration::from_secs(1));
    }
}
