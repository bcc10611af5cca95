//! Configuration for the lease queue and the consumer loops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::BusError;

/// Upper bound on every configured duration, one year.
pub const MAX_CONFIG_SECS: u64 = 365 * 24 * 60 * 60;

/// Tunables shared by every queue on a [`QueueBus`](crate::QueueBus).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Lifetime of a lease in seconds. A job whose lease lapsed is
    /// reclaimed by the next sweep.
    pub lease_ttl_secs: u64,
    /// Period of the sweep that requeues abandoned jobs (milliseconds).
    pub sweep_interval_ms: u64,
    /// Namespace prepended to every queue key.
    pub key_prefix: String,
    /// Back-off after a failed claim before trying again (milliseconds).
    pub claim_retry_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 60,
            sweep_interval_ms: 60_000,
            key_prefix: String::new(),
            claim_retry_ms: 1_000,
        }
    }
}

impl BusConfig {
    pub fn with_lease_ttl_secs(mut self, secs: u64) -> Self {
        self.lease_ttl_secs = secs;
        self
    }

    pub fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_claim_retry_ms(mut self, ms: u64) -> Self {
        self.claim_retry_ms = ms;
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn claim_retry(&self) -> Duration {
        Duration::from_millis(self.claim_retry_ms)
    }

    /// Reject settings that would make leases or sweeps meaningless, or
    /// that overflow the clock.
    pub fn validate(&self) -> Result<(), BusError> {
        check_range("lease_ttl_secs", self.lease_ttl_secs, MAX_CONFIG_SECS)?;
        check_range("sweep_interval_ms", self.sweep_interval_ms, MAX_CONFIG_SECS * 1_000)?;
        check_range("claim_retry_ms", self.claim_retry_ms, MAX_CONFIG_SECS * 1_000)?;
        if self.key_prefix.chars().any(char::is_whitespace) {
            return Err(BusError::Config(format!(
                "key_prefix must not contain whitespace: {:?}",
                self.key_prefix
            )));
        }
        Ok(())
    }

    /// Build a config from environment variables, falling back to defaults.
    ///
    /// - `BUS_LEASE_TTL_SECS` (default: `60`)
    /// - `BUS_SWEEP_INTERVAL_MS` (default: `60000`)
    /// - `BUS_KEY_PREFIX` (default: empty)
    /// - `BUS_CLAIM_RETRY_MS` (default: `1000`)
    pub fn from_env() -> Result<Self, BusError> {
        Self::from_vars(|name| std::env::var(name))
    }

    /// Same as [`from_env`](Self::from_env), reading variables through `var`.
    pub fn from_vars<F>(var: F) -> Result<Self, BusError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();
        let cfg = Self {
            lease_ttl_secs: parse_var(&var, "BUS_LEASE_TTL_SECS")?
                .unwrap_or(defaults.lease_ttl_secs),
            sweep_interval_ms: parse_var(&var, "BUS_SWEEP_INTERVAL_MS")?
                .unwrap_or(defaults.sweep_interval_ms),
            key_prefix: var("BUS_KEY_PREFIX")
                .map(|v| v.trim().to_string())
                .unwrap_or(defaults.key_prefix),
            claim_retry_ms: parse_var(&var, "BUS_CLAIM_RETRY_MS")?
                .unwrap_or(defaults.claim_retry_ms),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

fn check_range(name: &str, value: u64, max: u64) -> Result<(), BusError> {
    if value == 0 {
        return Err(BusError::Config(format!("{name} must be at least 1")));
    }
    if value > max {
        return Err(BusError::Config(format!("{name} must be at most {max}, got {value}")));
    }
    Ok(())
}

fn parse_var<F>(var: &F, var_name: &str) -> Result<Option<u64>, BusError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let v = match var(var_name) {
        Ok(v) if v.trim().is_empty() => return Ok(None),
        Ok(v) => v,
        Err(std::env::VarError::NotPresent) => return Ok(None),
        Err(e) => {
            return Err(BusError::Config(format!("failed reading {var_name}: {e}")));
        }
    };

    v.trim()
        .parse()
        .map(Some)
        .map_err(|e| BusError::Config(format!("invalid {var_name}={v}: {e}")))
}
