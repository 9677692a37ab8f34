//! Engine configuration loaded from environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use larder_inventory::CostPolicy;

use crate::coordinator::ShortfallPolicy;

pub const ENV_RESERVATION_TTL_SECS: &str = "LARDER_RESERVATION_TTL_SECS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "LARDER_SWEEP_INTERVAL_SECS";
pub const ENV_SWEEP_LOOKBACK_SECS: &str = "LARDER_SWEEP_LOOKBACK_SECS";
pub const ENV_COST_SCALE: &str = "LARDER_COST_SCALE";
pub const ENV_COMPONENT_SHORTFALL: &str = "LARDER_COMPONENT_SHORTFALL";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

/// Decimal places beyond this are not representable in a stored cost.
const MAX_COST_SCALE: u32 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be {expected} (got '{value}')")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Age after which an uncommitted hold is released by the sweep.
    pub reservation_ttl: Duration,
    pub sweep_interval: Duration,
    /// How far before the TTL cutoff the sweep looks for holds. Holds older
    /// than `reservation_ttl + sweep_lookback` are left for manual release.
    pub sweep_lookback: Duration,
    pub cost_scale: u32,
    pub component_shortfall: ShortfallPolicy,
    /// Postgres connection string; `None` runs against the in-memory store.
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            sweep_lookback: crate::sweep::DEFAULT_LOOKBACK,
            cost_scale: CostPolicy::default().scale,
            component_shortfall: ShortfallPolicy::Reject,
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Load from the process environment, falling back to defaults for unset
    /// variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let lookup = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let reservation_ttl = match lookup(ENV_RESERVATION_TTL_SECS) {
            Some(v) => Duration::from_secs(parse_positive(ENV_RESERVATION_TTL_SECS, &v)?),
            None => defaults.reservation_ttl,
        };
        let sweep_interval = match lookup(ENV_SWEEP_INTERVAL_SECS) {
            Some(v) => Duration::from_secs(parse_positive(ENV_SWEEP_INTERVAL_SECS, &v)?),
            None => defaults.sweep_interval,
        };
        let sweep_lookback = match lookup(ENV_SWEEP_LOOKBACK_SECS) {
            Some(v) => Duration::from_secs(parse_positive(ENV_SWEEP_LOOKBACK_SECS, &v)?),
            None => defaults.sweep_lookback,
        };
        let cost_scale = match lookup(ENV_COST_SCALE) {
            Some(v) => parse_scale(&v)?,
            None => defaults.cost_scale,
        };
        let component_shortfall = match lookup(ENV_COMPONENT_SHORTFALL) {
            Some(v) => ShortfallPolicy::parse(&v).ok_or_else(|| ConfigError::Invalid {
                var: ENV_COMPONENT_SHORTFALL,
                expected: "'reject' or 'clamp'",
                value: v.clone(),
            })?,
            None => defaults.component_shortfall,
        };

        Ok(Self {
            reservation_ttl,
            sweep_interval,
            sweep_lookback,
            cost_scale,
            component_shortfall,
            database_url: lookup(ENV_DATABASE_URL),
        })
    }

    pub fn cost_policy(&self) -> CostPolicy {
        CostPolicy::with_scale(self.cost_scale)
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            var,
            expected: "a positive number of seconds",
            value: value.to_string(),
        }),
    }
}

fn parse_scale(value: &str) -> Result<u32, ConfigError> {
    match value.trim().parse::<u32>() {
        Ok(n) if n <= MAX_COST_SCALE => Ok(n),
        _ => Err(ConfigError::Invalid {
            var: ENV_COST_SCALE,
            expected: "an integer between 0 and 10",
            value: value.to_string(),
        }),
    }
}
