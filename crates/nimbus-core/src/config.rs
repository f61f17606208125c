use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

const APP_DIR: &str = "nimbus";
const CONFIG_FILE: &str = "config.toml";
const API_KEY_ENV: &str = "OPENWEATHER_API_KEY";

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the snapshot database and last-location file
    pub data_dir: PathBuf,

    /// Provider and cache settings
    #[serde(default)]
    pub weather: WeatherConfig,

    /// Background favorites refresh settings
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Place shown when there is no fix and nothing cached
    #[serde(default)]
    pub fallback: FallbackPlace,
}

/// Unit system preference, named the way the provider names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnitPreference {
    #[default]
    Metric,
    Imperial,
    Standard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// Provider base URL (the One Call path is appended)
    pub api_base_url: String,

    /// Provider API key as written in the file. Use
    /// [`WeatherConfig::effective_api_key`], which also honors
    /// `OPENWEATHER_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Blocks excluded from the One Call response
    #[serde(default = "default_exclude")]
    pub exclude: String,

    /// Unit system used when the caller has no preference yet
    #[serde(default)]
    pub default_unit: UnitPreference,

    /// Snapshot validity window in minutes
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u32,

    /// Transport timeout for a single provider call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_exclude() -> String {
    "minutely,alerts".to_string()
}

fn default_ttl_minutes() -> u32 {
    15
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl WeatherConfig {
    /// Snapshot TTL in milliseconds.
    pub fn ttl_ms(&self) -> i64 {
        i64::from(self.ttl_minutes) * 60 * 1000
    }

    /// `OPENWEATHER_API_KEY` if set, else the configured key.
    ///
    /// The environment value is never copied into the config, so saving
    /// cannot write it to disk.
    pub fn effective_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.api_key.clone().filter(|k| !k.trim().is_empty()))
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.openweathermap.org".to_string(),
            api_key: None,
            exclude: default_exclude(),
            default_unit: UnitPreference::default(),
            ttl_minutes: default_ttl_minutes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Maximum concurrent revalidations during a favorites pass (default: 3)
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Skip the favorites pass below this battery level (default: 15)
    #[serde(default = "default_min_battery_percent")]
    pub min_battery_percent: u8,
}

fn default_max_parallel() -> usize {
    3
}

fn default_min_battery_percent() -> u8 {
    15
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            min_battery_percent: default_min_battery_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackPlace {
    pub label: String,
    pub lat: f64,
    pub lon: f64,
}

impl Default for FallbackPlace {
    fn default() -> Self {
        Self {
            label: "Toronto, CA".to_string(),
            lat: 43.6532,
            lon: -79.3832,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            data_dir,
            weather: WeatherConfig::default(),
            refresh: RefreshConfig::default(),
            fallback: FallbackPlace::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from `path`, writing defaults there if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Warnings are logged; errors fail the load.
    pub fn load_validated(path: Option<&Path>) -> Result<(Self, ValidationResult)> {
        let config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        let validation = config.validate();

        if !validation.is_valid() {
            anyhow::bail!(
                "Configuration validation failed: {}",
                validation.error_summary()
            );
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_url(&self.weather.api_base_url, "weather.api_base_url", &mut result);

        if self.weather.ttl_minutes == 0 {
            result.add_error("weather.ttl_minutes", "TTL must be greater than 0");
        } else if self.weather.ttl_minutes > 1440 {
            result.add_warning(
                "weather.ttl_minutes",
                "Snapshots stay fresh for more than 24 hours",
            );
        }

        if self.weather.request_timeout_secs == 0 {
            result.add_error(
                "weather.request_timeout_secs",
                "Request timeout must be greater than 0",
            );
        }

        if self.weather.effective_api_key().is_none() {
            result.add_warning(
                "weather.api_key",
                "No API key configured - provider calls will be rejected",
            );
        }

        if self.refresh.max_parallel == 0 {
            result.add_error(
                "refresh.max_parallel",
                "Parallelism must be greater than 0",
            );
        }

        if self.refresh.min_battery_percent > 100 {
            result.add_error(
                "refresh.min_battery_percent",
                "Battery threshold must be between 0 and 100",
            );
        }

        if !(-90.0..=90.0).contains(&self.fallback.lat)
            || !(-180.0..=180.0).contains(&self.fallback.lon)
        {
            result.add_error("fallback", "Fallback coordinates are out of range");
        }

        result
    }

    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }
                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Path of the SQLite database holding snapshots and favorites
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("weather.db")
    }

    /// Path of the last-location document
    pub fn last_location_path(&self) -> PathBuf {
        self.data_dir.join("last_location.json")
    }

    /// `<config_dir>/nimbus/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(APP_DIR);

        Ok(config_dir.join(CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn test_valid_default_config() {
        let config = Config::default();
        let result = config.validate();
        assert!(result.is_valid(), "Default config should be valid: {:?}", result.errors);
    }

    #[test]
    fn test_default_ttl_is_fifteen_minutes() {
        assert_eq!(WeatherConfig::default().ttl_ms(), 900_000);
    }

    #[test]
    fn test_invalid_url_scheme() {
        let mut config = Config::default();
        config.weather.api_base_url = "ftp://example.com".to_string();
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.message.contains("http or https")));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = Config::default();
        config.weather.ttl_minutes = 0;
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.field == "weather.ttl_minutes"));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut config = Config::default();
        config.refresh.max_parallel = 0;
        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.field == "refresh.max_parallel"));
    }

    #[test]
    fn test_missing_api_key_is_warning() {
        if std::env::var(API_KEY_ENV).is_ok() {
            // An exported key legitimately silences the warning
            return;
        }
        let mut config = Config::default();
        config.weather.api_key = None;
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.field == "weather.api_key"));
    }

    #[test]
    fn test_load_from_creates_defaults_then_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.weather.ttl_minutes, created.weather.ttl_minutes);
        assert_eq!(loaded.refresh.max_parallel, 3);
        assert_eq!(loaded.fallback.label, "Toronto, CA");
    }

    #[test]
    fn test_default_unit_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::load_from(&path).unwrap();
        assert_eq!(config.weather.default_unit, UnitPreference::Metric);

        config.weather.default_unit = UnitPreference::Imperial;
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.weather.default_unit, UnitPreference::Imperial);
    }

    #[test]
    fn test_saved_file_only_holds_the_configured_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::load_from(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("api_key"), "fresh config must not carry a key: {}", written);

        config.weather.api_key = Some("from-file".to_string());
        config.save_to(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("api_key = \"from-file\""));
        assert_eq!(
            Config::load_from(&path).unwrap().weather.api_key.as_deref(),
            Some("from-file")
        );
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "data_dir = \"/tmp/nimbus\"\n[weather]\napi_base_url = \"http://localhost:9000\"\ndefault_unit = \"imperial\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.weather.default_unit, UnitPreference::Imperial);
        assert_eq!(config.weather.ttl_minutes, 15);
        assert_eq!(config.weather.exclude, "minutely,alerts");
        assert_eq!(config.refresh.min_battery_percent, 15);
    }

    #[test]
    fn test_validation_result_error_summary() {
        let mut result = ValidationResult::default();
        result.add_error("field1", "error1");
        result.add_error("field2", "error2");
        let summary = result.error_summary();
        assert!(summary.contains("field1"));
        assert!(summary.contains("field2"));
    }
}
