//! Daemon configuration document
//!
//! A single JSON file read at startup. Every section has defaults so a
//! missing or partial file still yields a runnable daemon.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Top-level tollgated configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enables the wireless gateway manager.
    pub reseller_mode: bool,
    /// Markup over the upstream price when mirroring (0.1 = 10%).
    pub margin: f64,
    /// Local step size, in the local metric.
    pub step_size: u64,
    /// Price advertised when the upstream is unpriced: the maximum
    /// configured price among the accepted mints.
    pub fallback_price_per_step: Option<u64>,
    /// Mint URLs the wallet should load and accept for purchases.
    pub accepted_mints: Vec<String>,
    /// TCP port gateways serve their advertisement endpoint on.
    pub advert_port: u16,
    pub crowsnest: CrowsnestConfig,
    pub chandler: ChandlerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrowsnestConfig {
    /// Per-probe HTTP timeout, seconds.
    pub probe_timeout_secs: u64,
    /// Outer bound on a whole discovery attempt, seconds.
    pub discovery_timeout_secs: u64,
    /// Age after which a failed discovery attempt may be retried.
    pub retry_age_secs: u64,
    /// Interfaces never probed or monitored.
    pub ignore_interfaces: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChandlerConfig {
    pub max_price_per_millisecond: f64,
    pub max_price_per_byte: f64,
    pub trust: TrustConfig,
    pub preferred_session_increments_milliseconds: u64,
    pub preferred_session_increments_bytes: u64,
    pub millisecond_renewal_offset: u64,
    pub bytes_renewal_offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub default_policy: TrustPolicy,
    pub allowlist: HashSet<String>,
    pub blocklist: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    #[default]
    TrustAll,
    TrustNone,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reseller_mode: false,
            margin: 0.1,
            step_size: 60_000,
            fallback_price_per_step: None,
            accepted_mints: Vec::new(),
            advert_port: 2121,
            crowsnest: CrowsnestConfig::default(),
            chandler: ChandlerConfig::default(),
        }
    }
}

impl Default for CrowsnestConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 10,
            discovery_timeout_secs: 300,
            retry_age_secs: 300,
            ignore_interfaces: vec!["lo".to_string()],
        }
    }
}

impl Default for ChandlerConfig {
    fn default() -> Self {
        Self {
            // ~10k sats per hour
            max_price_per_millisecond: 0.00278,
            max_price_per_byte: 0.000_01,
            trust: TrustConfig::default(),
            preferred_session_increments_milliseconds: 60_000,
            preferred_session_increments_bytes: 1_048_576,
            millisecond_renewal_offset: 5_000,
            bytes_renewal_offset: 10_485_760,
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            default_policy: TrustPolicy::TrustAll,
            allowlist: HashSet::new(),
            blocklist: HashSet::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults
    /// when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!("no config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let data = std::fs::read(path)?;
        let config: Config = serde_json::from_slice(&data)?;
        Ok(config)
    }
}
