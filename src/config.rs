//! Client configuration

use crate::error::{PaymentError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a payment client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the wallet server used for balance queries
    #[serde(default = "default_wallet_url")]
    pub wallet_url: String,

    /// Balance polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deadline for every channel engine call, in seconds
    #[serde(default = "default_engine_timeout_secs")]
    pub engine_timeout_secs: u64,

    /// Deadline for a single balance query, in seconds
    #[serde(default = "default_balance_timeout_secs")]
    pub balance_timeout_secs: u64,

    /// On-chain challenge duration for new channels, in seconds
    #[serde(default = "default_challenge_duration_secs")]
    pub challenge_duration_secs: u64,
}

fn default_wallet_url() -> String {
    "http://localhost:8090/v2".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_engine_timeout_secs() -> u64 {
    30
}

fn default_balance_timeout_secs() -> u64 {
    10
}

fn default_challenge_duration_secs() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            wallet_url: default_wallet_url(),
            poll_interval_ms: default_poll_interval_ms(),
            engine_timeout_secs: default_engine_timeout_secs(),
            balance_timeout_secs: default_balance_timeout_secs(),
            challenge_duration_secs: default_challenge_duration_secs(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PaymentError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            PaymentError::ConfigError(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wallet_url.trim().is_empty() {
            return Err(PaymentError::ConfigError("wallet_url is empty".to_string()));
        }
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("engine_timeout_secs", self.engine_timeout_secs),
            ("balance_timeout_secs", self.balance_timeout_secs),
        ] {
            if value == 0 {
                return Err(PaymentError::ConfigError(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn balance_timeout(&self) -> Duration {
        Duration::from_secs(self.balance_timeout_secs)
    }

    pub fn challenge_duration(&self) -> Duration {
        Duration::from_secs(self.challenge_duration_secs)
    }
}
