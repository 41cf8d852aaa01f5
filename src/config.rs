use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppError, Result};

/// Top-level configuration, loaded once at startup and shared immutably
/// with every component that needs it (the "global singleton settings"
/// pattern replaced by an explicitly-passed capability, per the design
/// notes on conditional state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Shared secret for `X-API-Secret`. `None`/empty means the server is open.
    #[serde(default)]
    pub api_secret: Option<String>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub trust: TrustConfig,

    #[serde(default)]
    pub update_watcher: UpdateWatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Heartbeat interval in seconds. `adjust_rate_limits` may double this at runtime.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Snapshots older than this many days are eligible for pruning.
    #[serde(default = "default_snapshot_retention_days")]
    pub snapshot_retention_days: i64,

    /// Default cooldown applied to every self-healing action, in seconds.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            snapshot_retention_days: default_snapshot_retention_days(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Threshold used by `should_auto_send` when the caller does not override it.
    #[serde(default = "default_trust_threshold")]
    pub auto_send_threshold: f64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            auto_send_threshold: default_trust_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateWatcherConfig {
    #[serde(default)]
    pub auto_apply: bool,

    /// Release-oracle base URL. Absent means the skill degrades to a no-op.
    #[serde(default)]
    pub oracle_url: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_interval_seconds() -> u64 {
    300
}
fn default_snapshot_retention_days() -> i64 {
    30
}
fn default_cooldown_seconds() -> i64 {
    300
}
fn default_trust_threshold() -> f64 {
    0.85
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_secret: None,
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
            trust: TrustConfig::default(),
            update_watcher: UpdateWatcherConfig::default(),
        }
    }
}

impl Config {
    /// Load config from the given path, or the default XDG config location.
    /// A missing file is not an error — the process starts with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_config_path(),
        };

        let config = if config_path.exists() {
            info!("loading config from {}", config_path.display());
            let contents = std::fs::read_to_string(&config_path).map_err(AppError::Io)?;
            toml::from_str(&contents).map_err(|e| AppError::Config(format!("parse error: {e}")))?
        } else {
            info!("no config file found at {}, using defaults", config_path.display());
            Config::default()
        };

        Ok(config)
    }

    /// Returns the default config file path: `$XDG_CONFIG_HOME/skillmesh/config.toml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("skillmesh")
            .join("config.toml")
    }

    /// Returns the data directory: `$XDG_DATA_HOME/skillmesh/`
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("skillmesh")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = Config::default();
        assert_eq!(cfg.scheduler.interval_seconds, 300);
        assert_eq!(cfg.health.cooldown_seconds, 300);
        assert!(cfg.api_secret.is_none());
    }

    #[test]
    fn load_missing_path_falls_back_to_defaults() {
        let cfg = Config::load(Some(Path::new("/nonexistent/skillmesh.toml"))).unwrap();
        assert_eq!(cfg.bind, default_bind());
    }

    #[test]
    fn load_parses_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            bind = "0.0.0.0:9090"
            api_secret = "s3cr3t"

            [scheduler]
            interval_seconds = 60
            "#,
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:9090");
        assert_eq!(cfg.api_secret.as_deref(), Some("s3cr3t"));
        assert_eq!(cfg.scheduler.interval_seconds, 60);
    }
}
