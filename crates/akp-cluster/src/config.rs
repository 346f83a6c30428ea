//! Reconciler configuration
//!
//! Values come from defaults, a deserialized document, or the environment.
//! Environment access goes through [`EnvSource`] so tests never touch
//! process-global state.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use akp_common::{Error, Result, DEFAULT_FIELD_MANAGER};

/// Organization identifier
pub const ENV_ORG_ID: &str = "AKP_ORG_ID";
/// Status poll interval in seconds
pub const ENV_POLL_INTERVAL_SECS: &str = "AKP_POLL_INTERVAL_SECS";
/// Settle delay after remote delete in seconds
pub const ENV_DELETE_SETTLE_SECS: &str = "AKP_DELETE_SETTLE_SECS";
/// Per-object deletion wait in seconds
pub const ENV_DELETION_TIMEOUT_SECS: &str = "AKP_DELETION_TIMEOUT_SECS";

/// Trait for reading configuration from the environment
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Look up a variable
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads from process environment variables
#[derive(Clone, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

fn duration_secs<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Settings shared by every reconciler operation
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Organization owning the instances
    pub organization_id: String,
    /// Delay between status fetches
    #[serde(rename = "poll_interval_secs", deserialize_with = "duration_secs")]
    pub poll_interval: Duration,
    /// Pause after a successful remote delete
    #[serde(rename = "delete_settle_delay_secs", deserialize_with = "duration_secs")]
    pub delete_settle_delay: Duration,
    /// How long to wait for each deleted object to disappear
    #[serde(rename = "deletion_timeout_secs", deserialize_with = "duration_secs")]
    pub deletion_timeout: Duration,
    /// Field manager recorded on applied objects
    pub field_manager: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            organization_id: String::new(),
            poll_interval: Duration::from_secs(1),
            delete_settle_delay: Duration::from_secs(1),
            deletion_timeout: Duration::from_secs(120),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

fn secs(env: &dyn EnvSource, key: &str, default: Duration) -> Result<Duration> {
    match env.var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| Error::config(format!("{key}={raw:?} is not a number of seconds: {e}"))),
    }
}

impl ReconcilerConfig {
    /// Config for an organization with default timings
    pub fn new(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            ..Default::default()
        }
    }

    /// Load from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_env_source(&OsEnv)
    }

    /// Load from an environment source; unset variables keep their defaults
    pub fn from_env_source(env: &dyn EnvSource) -> Result<Self> {
        let defaults = Self::default();
        let organization_id = env
            .var(ENV_ORG_ID)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::config(format!("{ENV_ORG_ID} is not set")))?;

        Ok(Self {
            organization_id,
            poll_interval: secs(env, ENV_POLL_INTERVAL_SECS, defaults.poll_interval)?,
            delete_settle_delay: secs(env, ENV_DELETE_SETTLE_SECS, defaults.delete_settle_delay)?,
            deletion_timeout: secs(env, ENV_DELETION_TIMEOUT_SECS, defaults.deletion_timeout)?,
            field_manager: defaults.field_manager,
        })
    }
}
