//! Engine configuration.
//!
//! [`EngineConfig::default`] holds the production defaults;
//! [`EngineConfig::from_env`] overlays `SANDPIPER_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::CoreError;
use crate::lang::Limits;

/// Per-execution resource ceilings for the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_duration_ms: u64,
    pub max_memory_bytes: u64,
    pub max_allocations: u64,
    pub max_recursion_depth: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_duration_ms: 30_000,
            max_memory_bytes: 128 * 1024 * 1024,
            max_allocations: 5_000_000,
            max_recursion_depth: 200,
        }
    }
}

impl From<&ResourceLimits> for Limits {
    fn from(limits: &ResourceLimits) -> Self {
        Limits {
            max_duration: Duration::from_millis(limits.max_duration_ms),
            max_memory_bytes: limits.max_memory_bytes,
            max_allocations: limits.max_allocations,
            max_recursion_depth: limits.max_recursion_depth as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: ResourceLimits,
    /// Upper bound for `fetch(limit=...)`; a missing limit is capped to it.
    pub max_fetch_limit: usize,
    /// Model blocks requested per turn before the turn is ended.
    pub max_model_steps: usize,
    /// Rows rendered when the model loads an earlier result.
    pub max_load_rows: usize,
    /// Longest one external call may wait on the store.
    pub max_dispatch_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            max_fetch_limit: 10_000,
            max_model_steps: 25,
            max_load_rows: 100,
            max_dispatch_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `SANDPIPER_*` environment variables.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let mut config = Self::default();
        let limits = &mut config.limits;
        overlay(&lookup, "SANDPIPER_MAX_DURATION_MS", &mut limits.max_duration_ms)?;
        overlay(&lookup, "SANDPIPER_MAX_MEMORY_BYTES", &mut limits.max_memory_bytes)?;
        overlay(&lookup, "SANDPIPER_MAX_ALLOCATIONS", &mut limits.max_allocations)?;
        overlay(&lookup, "SANDPIPER_MAX_RECURSION_DEPTH", &mut limits.max_recursion_depth)?;
        overlay(&lookup, "SANDPIPER_MAX_FETCH_LIMIT", &mut config.max_fetch_limit)?;
        overlay(&lookup, "SANDPIPER_MAX_MODEL_STEPS", &mut config.max_model_steps)?;
        overlay(&lookup, "SANDPIPER_MAX_LOAD_ROWS", &mut config.max_load_rows)?;
        overlay(&lookup, "SANDPIPER_MAX_DISPATCH_MS", &mut config.max_dispatch_ms)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero limits.
    pub fn validate(&self) -> Result<(), CoreError> {
        let checks = [
            ("limits.max_duration_ms", self.limits.max_duration_ms),
            ("limits.max_memory_bytes", self.limits.max_memory_bytes),
            ("limits.max_allocations", self.limits.max_allocations),
            ("limits.max_recursion_depth", self.limits.max_recursion_depth as u64),
            ("max_fetch_limit", self.max_fetch_limit as u64),
            ("max_model_steps", self.max_model_steps as u64),
            ("max_load_rows", self.max_load_rows as u64),
            ("max_dispatch_ms", self.max_dispatch_ms),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(CoreError::Config(format!("{name} must be greater than zero"))),
            None => Ok(()),
        }
    }

    pub fn interpreter_limits(&self) -> Limits {
        Limits::from(&self.limits)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.max_dispatch_ms)
    }
}

fn overlay<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), CoreError> {
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Config(format!("{key}: invalid value '{raw}'")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.limits.max_duration_ms, 30_000);
        assert_eq!(config.max_fetch_limit, 10_000);
        assert_eq!(config.max_model_steps, 25);
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overlay() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("SANDPIPER_MAX_DURATION_MS", "250"),
            ("SANDPIPER_MAX_FETCH_LIMIT", " 50 "),
        ]))
        .unwrap();
        assert_eq!(config.limits.max_duration_ms, 250);
        assert_eq!(config.max_fetch_limit, 50);
        assert_eq!(config.limits.max_allocations, 5_000_000);
        assert_eq!(
            config.interpreter_limits().max_duration,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_malformed_env_value() {
        let err = EngineConfig::from_lookup(lookup(&[("SANDPIPER_MAX_MODEL_STEPS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("SANDPIPER_MAX_MODEL_STEPS"));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("SANDPIPER_MAX_RECURSION_DEPTH", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("max_recursion_depth"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_model_steps": 3, "limits": {"max_duration_ms": 10}}"#)
                .unwrap();
        assert_eq!(config.max_model_steps, 3);
        assert_eq!(config.limits.max_duration_ms, 10);
        assert_eq!(config.limits.max_recursion_depth, 200);
    }
}
