//! Configuration for the routing engine

use crate::error::{Result, RouteError};
use crate::retry::RetryConfig;
use ledger_client::{Amount, SimulationSettings};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Routing engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fee model
    pub fees: FeeConfig,

    /// Edge retry policy
    pub retry: RetryConfig,

    /// Call and run deadlines
    pub timeouts: TimeoutConfig,

    /// Run state persistence
    pub storage: StorageConfig,

    /// Simulated ledger used by the CLI
    pub simulation: SimulationConfig,

    /// Display units
    pub units: UnitsConfig,
}

/// Fee configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Protocol surcharge as a percentage of the network fee (k)
    pub surcharge_percent: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            surcharge_percent: 19,
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per ledger call timeout (milliseconds)
    pub call_timeout_ms: u64,

    /// Whole-run deadline, checked before each stage (seconds)
    pub run_timeout_secs: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000, // 30 seconds
            run_timeout_secs: None,
        }
    }
}

impl TimeoutConfig {
    /// Per-call timeout as a duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Run deadline as a duration
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding run states, seeds and the ledger snapshot
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./data/routing"),
        }
    }
}

impl StorageConfig {
    /// Location of the simulated ledger snapshot
    pub fn ledger_snapshot(&self) -> PathBuf {
        self.state_dir.join("ledger.json")
    }
}

/// Simulated ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Flat network fee per transfer (feeL1)
    pub network_fee: u64,

    /// Artificial latency per call (milliseconds)
    pub latency_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            network_fee: 180,
            latency_ms: 0,
        }
    }
}

/// Display units
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitsConfig {
    /// Decimal places of the base unit
    pub decimals: u32,

    /// Currency symbol
    pub symbol: String,
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            decimals: 18,
            symbol: "MNT".to_string(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| RouteError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        Config::default().with_env_overrides()
    }

    /// Apply `ROUTING_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("ROUTING_STATE_DIR") {
            self.storage.state_dir = PathBuf::from(dir);
        }

        if let Some(percent) = env_parse("ROUTING_SURCHARGE_PERCENT")? {
            self.fees.surcharge_percent = percent;
        }

        if let Some(attempts) = env_parse("ROUTING_MAX_ATTEMPTS")? {
            self.retry.max_attempts = attempts;
        }

        if let Some(ms) = env_parse("ROUTING_CALL_TIMEOUT_MS")? {
            self.timeouts.call_timeout_ms = ms;
        }

        if let Some(secs) = env_parse("ROUTING_RUN_TIMEOUT_SECS")? {
            self.timeouts.run_timeout_secs = Some(secs);
        }

        if let Some(fee) = env_parse("ROUTING_NETWORK_FEE")? {
            self.simulation.network_fee = fee;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject values the scheduler cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(RouteError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.timeouts.call_timeout_ms == 0 {
            return Err(RouteError::Config("timeouts.call_timeout_ms must be positive".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(RouteError::Config("retry.backoff_multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(RouteError::Config("retry.jitter_factor must be within 0..=1".into()));
        }
        Ok(())
    }

    /// Settings for the simulated ledger
    pub fn simulation_settings(&self) -> SimulationSettings {
        SimulationSettings {
            network_fee: Amount::from(self.simulation.network_fee),
            surcharge_percent: self.fees.surcharge_percent,
            latency_ms: self.simulation.latency_ms,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RouteError::Config(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.fees.surcharge_percent, 19);
        assert_eq!(config.simulation.network_fee, 180);
        assert_eq!(config.timeouts.run_timeout(), None);
        assert_eq!(config.units.decimals, 18);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.toml");
        std::fs::write(
            &path,
            "[fees]\nsurcharge_percent = 25\n\n[retry]\nmax_attempts = 2\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.fees.surcharge_percent, 25);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_delay_ms, RetryConfig::default().initial_delay_ms);
        assert_eq!(config.simulation_settings().surcharge_percent, 25);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(RouteError::Config(_))));
    }
}
