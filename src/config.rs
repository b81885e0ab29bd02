// src/config.rs
//! Health engine configuration.
//!
//! Loaded from a YAML file; every key has a default so a missing file
//! section degrades to stock behavior instead of failing startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HealthError, Result};

fn default_enabled() -> bool {
    true
}

fn default_user_config_dir() -> PathBuf {
    PathBuf::from("health.d")
}

fn default_stock_config_dir() -> PathBuf {
    PathBuf::from("stock/health.d")
}

fn default_min_run_every() -> i64 {
    10
}

fn default_hibernation_delay() -> i64 {
    60
}

fn default_log_max_entries() -> usize {
    1000
}

fn default_notifier() -> String {
    "alarm-notify.sh".to_string()
}

fn default_recipient() -> String {
    "root".to_string()
}

/// Configuration of the health engine (the `health` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Master switch; a disabled engine starts and idles.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Directory of user alarm/template definitions.
    #[serde(default = "default_user_config_dir")]
    pub health_config_dir: PathBuf,

    /// Directory of stock definitions, consulted after the user ones.
    #[serde(default = "default_stock_config_dir")]
    pub stock_health_config_dir: PathBuf,

    /// Lower bound on the tick period, seconds. Clamped to >= 1.
    #[serde(default = "default_min_run_every")]
    pub run_at_least_every_seconds: i64,

    /// How long to postpone alarm checks after a resume from
    /// suspension, seconds.
    #[serde(default = "default_hibernation_delay")]
    pub postpone_alarms_during_hibernation_for_seconds: i64,

    /// Per-host bound on in-memory alarm log entries.
    #[serde(default = "default_log_max_entries")]
    pub log_max_entries: usize,

    /// Optional silencers file, loaded once at startup.
    #[serde(default)]
    pub silencers_file: Option<PathBuf>,

    /// Optional directory for per-host alarm log persistence.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Default notifier executable for alarms without an override.
    #[serde(default = "default_notifier")]
    pub default_notifier: String,

    /// Default recipient for alarms without an override.
    #[serde(default = "default_recipient")]
    pub default_recipient: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            health_config_dir: default_user_config_dir(),
            stock_health_config_dir: default_stock_config_dir(),
            run_at_least_every_seconds: default_min_run_every(),
            postpone_alarms_during_hibernation_for_seconds: default_hibernation_delay(),
            log_max_entries: default_log_max_entries(),
            silencers_file: None,
            log_dir: None,
            default_notifier: default_notifier(),
            default_recipient: default_recipient(),
        }
    }
}

impl HealthConfig {
    /// Load the configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HealthError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: HealthConfig = serde_yaml::from_str(&text)?;
        config.normalize();
        Ok(config)
    }

    /// Clamp out-of-range values to the documented minimums.
    pub fn normalize(&mut self) {
        if self.run_at_least_every_seconds < 1 {
            self.run_at_least_every_seconds = 1;
        }
        if self.postpone_alarms_during_hibernation_for_seconds < 0 {
            self.postpone_alarms_during_hibernation_for_seconds = 0;
        }
        if self.log_max_entries == 0 {
            self.log_max_entries = default_log_max_entries();
        }
    }

    /// The persistence file for one host's alarm log, when enabled.
    pub fn host_log_path(&self, hostname: &str) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("health-log-{hostname}.ndjson")))
    }
}
