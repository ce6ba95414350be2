//! Configuration for the reconciler.
//!
//! Configuration is loaded with precedence: Env vars > Config file > Defaults
//!
//! # Example config file (claimguard.toml)
//! ```toml
//! scan_interval_ms = 500
//! sweep_interval_secs = 10
//! suppression_id = "Spawn_Camp"
//! marker_prefix = "ClaimGuard:"
//! reassignment = "recreate"
//! ```

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What to do with an existing guard when a claim changes hands `A -> B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReassignmentPolicy {
    /// Log the reassignment and keep the guard. The bootstrap sweep notices
    /// the marker/owner mismatch later and replaces it. Avoids guard churn
    /// when ownership flips rapidly.
    #[default]
    Keep,
    /// Remove the old guard and queue a creation for the new owner
    /// immediately.
    Recreate,
}

/// Main configuration for a [`crate::GuardReconciler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Minimum interval between member scans of one partition (ms)
    pub scan_interval_ms: u64,
    /// Cadence of the periodic bootstrap pass (s)
    pub sweep_interval_secs: u64,
    /// Capability tag value stamped on guards
    pub suppression_id: String,
    /// Attribution marker prefix
    pub marker_prefix: String,
    /// Owner reassignment policy
    pub reassignment: ReassignmentPolicy,
    /// Requests handled per queue per flush (0 = unbounded)
    pub max_flush_batch: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            suppression_id: DEFAULT_SUPPRESSION_ID.to_string(),
            marker_prefix: DEFAULT_MARKER_PREFIX.to_string(),
            reassignment: ReassignmentPolicy::default(),
            max_flush_batch: DEFAULT_MAX_FLUSH_BATCH,
        }
    }
}

impl ReconcilerConfig {
    /// Load configuration with precedence: Env > File > Defaults
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(ReconcilerConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Config suited to tests: no throttle, so every scan runs.
    pub fn unthrottled() -> Self {
        Self {
            scan_interval_ms: 0,
            ..Self::default()
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.suppression_id.is_empty() {
            return Err(ConfigError::new("suppression_id must not be empty"));
        }
        if self.marker_prefix.is_empty() {
            // An empty prefix would attribute every marked entity to us.
            return Err(ConfigError::new("marker_prefix must not be empty"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::new("sweep_interval_secs must be positive"));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
