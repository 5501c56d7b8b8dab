//! Configuration loaded from TOML
//!
//! Every field has a default, so an empty or missing file yields a working setup.

use crate::error::{ChartError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub chart: ChartDefaults,
    #[serde(default)]
    pub labels: LabelPolicy,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

/// Remote provider settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Viewport and scale defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartDefaults {
    /// Pixels per trading day at launch
    #[serde(default = "default_x_factor")]
    pub x_factor: f64,
    /// Device pixels per point
    #[serde(default = "default_contents_scale")]
    pub contents_scale: f64,
    /// Width of one price axis in points
    #[serde(default = "default_axis_width")]
    pub axis_width: f64,
    #[serde(default = "default_px_width")]
    pub px_width: f64,
    #[serde(default = "default_px_height")]
    pub px_height: f64,
}

/// Month label shortening thresholds, in pixels per bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelPolicy {
    /// Below this, January shows only the two-digit year
    #[serde(default = "default_year_only_below")]
    pub year_only_below: f64,
    /// Below this, other months show only their initial
    #[serde(default = "default_initial_only_below")]
    pub initial_only_below: f64,
}

/// Acquisition timing, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Requests are suppressed for this long after a network failure
    #[serde(default = "default_offline_backoff")]
    pub offline_backoff_secs: i64,
    /// Minimum spacing between intraday quotes
    #[serde(default = "default_intraday_refresh")]
    pub intraday_refresh_secs: i64,
    /// Intraday polling starts this long before the next close
    #[serde(default = "default_window_before_close")]
    pub intraday_before_close_secs: i64,
    /// Intraday polling continues this long after the next close
    #[serde(default = "default_window_after_close")]
    pub intraday_after_close_secs: i64,
    /// Settled end-of-day data is expected this long after a close
    #[serde(default = "default_settle_after_close")]
    pub settle_after_close_secs: i64,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rusty-chart")
}

fn default_database() -> String {
    "charts.db".to_string()
}

fn default_base_url() -> String {
    "https://chartinsight.com/api".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_x_factor() -> f64 {
    7.5
}

fn default_contents_scale() -> f64 {
    2.0
}

fn default_axis_width() -> f64 {
    30.0
}

fn default_px_width() -> f64 {
    1_280.0
}

fn default_px_height() -> f64 {
    720.0
}

fn default_year_only_below() -> f64 {
    4.0
}

fn default_initial_only_below() -> f64 {
    2.0
}

fn default_offline_backoff() -> i64 {
    60
}

fn default_intraday_refresh() -> i64 {
    60
}

fn default_window_before_close() -> i64 {
    23_000
}

fn default_window_after_close() -> i64 {
    3_600
}

fn default_settle_after_close() -> i64 {
    3_600
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ChartDefaults {
    fn default() -> Self {
        Self {
            x_factor: default_x_factor(),
            contents_scale: default_contents_scale(),
            axis_width: default_axis_width(),
            px_width: default_px_width(),
            px_height: default_px_height(),
        }
    }
}

impl Default for LabelPolicy {
    fn default() -> Self {
        Self {
            year_only_below: default_year_only_below(),
            initial_only_below: default_initial_only_below(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            offline_backoff_secs: default_offline_backoff(),
            intraday_refresh_secs: default_intraday_refresh(),
            intraday_before_close_secs: default_window_before_close(),
            intraday_after_close_secs: default_window_after_close(),
            settle_after_close_secs: default_settle_after_close(),
        }
    }
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: default_database(),
            api: ApiConfig::default(),
            chart: ChartDefaults::default(),
            labels: LabelPolicy::default(),
            acquisition: AcquisitionConfig::default(),
        }
    }
}

impl ChartConfig {
    /// Parse a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| ChartError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from `path`, or from `~/.rusty-chart/config.toml` when no path is given
    ///
    /// An explicit path that cannot be read or parsed is an error. A missing default
    /// file falls back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(config_path) = path {
            let contents = fs::read_to_string(config_path).map_err(|e| {
                ChartError::Config(format!(
                    "Failed to read config {}: {}",
                    config_path.display(),
                    e
                ))
            })?;
            return Self::from_toml(&contents);
        }

        if let Some(home) = dirs::home_dir() {
            let default_config = home.join(".rusty-chart").join("config.toml");
            if default_config.exists() {
                match fs::read_to_string(&default_config) {
                    Ok(contents) => return Self::from_toml(&contents),
                    Err(e) => log::warn!(
                        "Ignoring unreadable config {}: {}",
                        default_config.display(),
                        e
                    ),
                }
            }
        }

        Ok(Self::default())
    }

    /// Full path of the SQLite database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ChartConfig::from_toml("").unwrap();
        assert_eq!(config.chart.x_factor, 7.5);
        assert_eq!(config.acquisition.offline_backoff_secs, 60);
        assert_eq!(config.acquisition.intraday_before_close_secs, 23_000);
        assert_eq!(config.labels.initial_only_below, 2.0);
        assert_eq!(config.database, "charts.db");
    }

    #[test]
    fn test_partial_sections() {
        let config = ChartConfig::from_toml(
            r#"
            data_dir = "/tmp/charts"

            [api]
            token = "secret"

            [labels]
            year_only_below = 5.0
            "#,
        )
        .unwrap();
        assert_eq!(config.api.token, "secret");
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.labels.year_only_below, 5.0);
        assert_eq!(config.labels.initial_only_below, 2.0);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/charts/charts.db"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[chart]\nx_factor = 3.0").unwrap();
        let config = ChartConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.chart.x_factor, 3.0);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(matches!(
            ChartConfig::from_toml("chart = 5"),
            Err(ChartError::Config(_))
        ));
        let missing = Path::new("/definitely/not/here.toml");
        assert!(ChartConfig::load(Some(missing)).is_err());
    }
}
