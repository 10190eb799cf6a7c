use std::path::{Path, PathBuf};

use serde::Deserialize;

use agbot_common::pattern::ServedPattern;

use crate::error::BotError;

/// Workers draining the shared work channel.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Seconds an agreement may sit unfinalized before the deadline sweep
/// terminates it.
pub const DEFAULT_AGREEMENT_TIMEOUT_SECS: u64 = 300;

/// Interval of the finalization-deadline sweep.
pub const DEFAULT_FINALIZATION_SWEEP_SECS: u64 = 30;

/// Interval of the data-verification sweep.
pub const DEFAULT_DV_SWEEP_SECS: u64 = 15;

/// Interval of the ledger-presence sweep.
pub const DEFAULT_CLIENT_SWEEP_SECS: u64 = 60;

/// Interval of the pattern reconciliation pass.
pub const DEFAULT_PATTERN_SWEEP_SECS: u64 = 300;

/// Interval of the exchange inbox poll.
pub const DEFAULT_INBOX_POLL_SECS: u64 = 10;

/// Fallback data-verification check rate when the policy leaves it unset.
pub const DEFAULT_DV_CHECK_RATE_SECS: u64 = 60;

/// Extension of generated policy files.
pub const POLICY_FILE_EXT: &str = "policy";

/// The protocol name this bot drives.
pub const DEFAULT_PROTOCOL: &str = "standard";

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_agreement_timeout() -> u64 {
    DEFAULT_AGREEMENT_TIMEOUT_SECS
}

fn default_finalization_sweep() -> u64 {
    DEFAULT_FINALIZATION_SWEEP_SECS
}

fn default_dv_sweep() -> u64 {
    DEFAULT_DV_SWEEP_SECS
}

fn default_client_sweep() -> u64 {
    DEFAULT_CLIENT_SWEEP_SECS
}

fn default_pattern_sweep() -> u64 {
    DEFAULT_PATTERN_SWEEP_SECS
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

fn default_policy_dir() -> PathBuf {
    PathBuf::from("policies")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// This bot's exchange identity.
    pub bot_id: String,
    /// Base URL of the exchange API.
    pub exchange_url: String,
    /// Exchange auth token, passed along to requested ledger containers.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_agreement_timeout")]
    pub agreement_timeout_secs: u64,
    #[serde(default = "default_finalization_sweep")]
    pub finalization_sweep_secs: u64,
    #[serde(default = "default_dv_sweep")]
    pub dv_sweep_secs: u64,
    #[serde(default = "default_client_sweep")]
    pub client_sweep_secs: u64,
    #[serde(default = "default_pattern_sweep")]
    pub pattern_sweep_secs: u64,
    /// Directory generated policy files are written to. Owned exclusively
    /// by the pattern manager.
    #[serde(default = "default_policy_dir")]
    pub policy_dir: PathBuf,
    /// Directory for the agreement store and key material.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub served_patterns: Vec<ServedPattern>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, BotError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BotError> {
        if self.bot_id.is_empty() {
            return Err(BotError::Config("botId must not be empty".to_string()));
        }
        if self.exchange_url.is_empty() {
            return Err(BotError::Config(
                "exchangeUrl must not be empty".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(BotError::Config(
                "workerCount must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Config {
            bot_id: "agbot-test".to_string(),
            exchange_url: "http://localhost:8080".to_string(),
            token: String::new(),
            protocol: default_protocol(),
            worker_count: default_worker_count(),
            agreement_timeout_secs: default_agreement_timeout(),
            finalization_sweep_secs: default_finalization_sweep(),
            dv_sweep_secs: default_dv_sweep(),
            client_sweep_secs: default_client_sweep(),
            pattern_sweep_secs: default_pattern_sweep(),
            policy_dir: default_policy_dir(),
            data_dir: default_data_dir(),
            served_patterns: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_applied() {
        let config: Config = serde_json::from_str(
            r#"{"botId": "agbot1", "exchangeUrl": "https://exchange.example"}"#,
        )
        .expect("parse config");
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(config.protocol, DEFAULT_PROTOCOL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        let config: Config = serde_json::from_str(
            r#"{"botId": "agbot1", "exchangeUrl": "https://exchange.example", "workerCount": 0}"#,
        )
        .expect("parse config");
        assert!(config.validate().is_err());
    }
}
