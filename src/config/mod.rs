//! Configuration module

use std::time::Duration;

use serde::Deserialize;

use crate::error::TrackerError;
use crate::miitown::client::{Authorization, BASE_URL};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Speed at or above which a device is always reported as driving
    #[serde(default)]
    pub driving_speed: Option<f64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            driving_speed: None,
        }
    }
}

impl TrackerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Token blob persisted from an earlier login
    #[serde(default)]
    pub authorization: Option<Authorization>,
}

fn default_base_url() -> String {
    BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_scan_interval() -> u64 {
    10
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("MIITOWN").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.tracker.scan_interval_secs == 0 {
            return Err(TrackerError::Config(
                "tracker.scan_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.api.timeout_secs == 0 {
            return Err(TrackerError::Config(
                "api.timeout_secs must be greater than 0".to_string(),
            ));
        }
        url::Url::parse(&self.api.base_url)
            .map_err(|e| TrackerError::Config(format!("api.base_url: {}", e)))?;

        for account in &self.accounts {
            if account.username.trim().is_empty() {
                return Err(TrackerError::Config("account username is empty".to_string()));
            }
            if account.password.is_empty() && account.authorization.is_none() {
                return Err(TrackerError::Config(format!(
                    "account {} needs a password or a stored authorization",
                    account.username
                )));
            }
        }

        Ok(())
    }
}
