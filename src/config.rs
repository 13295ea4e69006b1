//! Engine configuration.
//!
//! Tunables for the retry loops and the two lock windows. Loaded from TOML the
//! same way the service configs are, or built in code for embedding.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SwapError;

/// Configuration for one swap engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    /// Interval between retry-loop probes in milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Upper bound on retry-loop attempts. `None` retries indefinitely, which
    /// matches the original behavior but can leak loops against a permanently
    /// failing counterpart; bounded is the safer default.
    #[serde(default)]
    pub max_retry_attempts: Option<u64>,
    /// Script-leg lock window in seconds (owner side, locks first, so the
    /// window is longer).
    #[serde(default = "default_script_lock_secs")]
    pub script_lock_duration_secs: u64,
    /// Contract-leg lock window in seconds.
    #[serde(default = "default_contract_lock_secs")]
    pub contract_lock_duration_secs: u64,
}

fn default_retry_interval_ms() -> u64 {
    5_000
}

fn default_script_lock_secs() -> u64 {
    3 * 3600
}

fn default_contract_lock_secs() -> u64 {
    3600
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            max_retry_attempts: None,
            script_lock_duration_secs: default_script_lock_secs(),
            contract_lock_duration_secs: default_contract_lock_secs(),
        }
    }
}

impl SwapConfig {
    /// Loads configuration from a TOML file.
    pub fn load_from_path(path: &str) -> Result<Self, SwapError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SwapError::Construction(format!("cannot read config {:?}: {}", path, e))
        })?;
        let config: SwapConfig = toml::from_str(&content).map_err(|e| {
            SwapError::Construction(format!("cannot parse config {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for consistency.
    ///
    /// The script-leg window must outlast the contract-leg window: the owner
    /// must still be able to refund after the participant's window has closed.
    pub fn validate(&self) -> Result<(), SwapError> {
        if self.retry_interval_ms == 0 {
            return Err(SwapError::Construction(
                "retry_interval_ms must be positive".into(),
            ));
        }
        if self.max_retry_attempts == Some(0) {
            return Err(SwapError::Construction(
                "max_retry_attempts must be positive when set".into(),
            ));
        }
        if self.script_lock_duration_secs <= self.contract_lock_duration_secs {
            return Err(SwapError::Construction(format!(
                "script lock window ({}s) must be longer than contract lock window ({}s)",
                self.script_lock_duration_secs, self.contract_lock_duration_secs
            )));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
