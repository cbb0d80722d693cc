//! Configuration management

use serde::{Deserialize, Serialize};
use standctl_core::{ConfiguredCredentials, Error, ReleaseHelper, Result, SerialLine};
use standctl_database::Inventory;
use standctl_scheduler::{DispatcherConfig, HousekeepingConfig, LanesConfig};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Units and capacity groups of the stand
    #[serde(default)]
    pub inventory: Inventory,

    /// Execution lanes
    #[serde(default)]
    pub lanes: LanesConfig,

    /// Default serial line parameters
    #[serde(default)]
    pub serial: SerialLine,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub housekeeping: HousekeepingConfig,

    #[serde(default)]
    pub reservations: ReservationsConfig,
}

/// Shell credential policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// User for shell tasks that do not name one
    pub default_user: String,
    /// Users the stand knows passwords for
    pub users: Vec<String>,
    /// Shared password of development images
    pub dev_password: Option<String>,
    /// Binary printing the password of release images
    pub release_helper: Option<String>,
    pub request_type: String,
    pub helper_timeout_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            default_user: "root".to_string(),
            users: vec!["root".to_string()],
            dev_password: None,
            release_helper: None,
            request_type: "release".to_string(),
            helper_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationsConfig {
    /// Lifetime of reservations that do not ask for one; unset means no expiry
    pub default_ttl_secs: Option<u64>,
}

fn default_database_url() -> String {
    "sqlite:data/standctl.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            inventory: Inventory::default(),
            lanes: LanesConfig::default(),
            serial: SerialLine::default(),
            credentials: CredentialsConfig::default(),
            housekeeping: HousekeepingConfig::default(),
            reservations: ReservationsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = if let Some(p) = path {
            Self::load_from_file(p)?
        } else {
            Self::load_from_env()?
        };

        // Secrets may live outside the config file
        if config.credentials.dev_password.is_none() {
            config.credentials.dev_password = get_secret("DEV_PASSWORD");
        }

        Ok(config)
    }

    /// Load from configuration file
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse a TOML configuration document
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables
    fn load_from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        // Inventory is too structured for a variable, point at a TOML file instead
        if let Ok(path) = std::env::var("STANDCTL_INVENTORY") {
            config.inventory = load_inventory(&path)?;
        }

        if let Ok(user) = std::env::var("STANDCTL_DEFAULT_USER") {
            config.credentials.users.push(user.clone());
            config.credentials.default_user = user;
        }
        config.credentials.release_helper = std::env::var("STANDCTL_RELEASE_HELPER").ok();

        Ok(config)
    }

    /// Settings handed to the task dispatcher
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            lanes: self.lanes.clone(),
            serial_line: self.serial,
            default_user: self.credentials.default_user.clone(),
            ..DispatcherConfig::default()
        }
    }

    /// Credential provider implementing the configured password policy
    pub fn credential_provider(&self) -> ConfiguredCredentials {
        let creds = &self.credentials;
        let release_helper = creds.release_helper.as_ref().map(|program| ReleaseHelper {
            program: program.clone(),
            request_type: creds.request_type.clone(),
            timeout: Duration::from_secs(creds.helper_timeout_secs),
        });

        ConfiguredCredentials::new(
            creds.users.clone(),
            creds.dev_password.clone(),
            release_helper,
        )
    }

    pub fn default_reservation_ttl(&self) -> Option<Duration> {
        self.reservations.default_ttl_secs.map(Duration::from_secs)
    }
}

/// Read an inventory from a standalone TOML file
fn load_inventory(path: &str) -> Result<Inventory> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ConfigError(format!("Failed to read inventory {}: {}", path, e)))?;

    toml::from_str(&content)
        .map_err(|e| Error::ConfigError(format!("Failed to parse inventory {}: {}", path, e)))
}

/// Get secret from environment variable or file
///
/// Supports both direct environment variables and file-based secrets (Docker/Kubernetes pattern).
/// If `VAR_NAME` is not found, tries `VAR_NAME_FILE` which should point to a file containing the secret.
pub fn get_secret(var_name: &str) -> Option<String> {
    if let Ok(value) = std::env::var(var_name) {
        return Some(value);
    }

    let file_var = format!("{}_FILE", var_name);
    if let Ok(path) = std::env::var(&file_var) {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            return Some(contents.trim().to_string());
        }
    }

    None
}
