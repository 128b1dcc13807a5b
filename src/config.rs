//! Configuration file handling.
//!
//! Settings come from an optional `sekolah.toml`; every field has a
//! default so a missing file or section is never an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "sekolah.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub report: ReportConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    File,
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Location of the file backend's JSON document.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            database_url: None,
        }
    }
}

fn default_backend() -> BackendKind {
    BackendKind::File
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/sekolah.json")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Markdown,
    Json,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Markdown => "md",
            OutputFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Preferred directory for the report file.
    #[serde(default = "default_report_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_file_name")]
    pub file_name: String,

    #[serde(default = "default_format")]
    pub format: OutputFormat,

    /// Synthesize placeholder students when the store is empty.
    #[serde(default)]
    pub demo_fallback: bool,

    /// Rows used by the tallest bar of the text chart.
    #[serde(default = "default_chart_height")]
    pub chart_height: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: default_report_dir(),
            file_name: default_file_name(),
            format: default_format(),
            demo_fallback: false,
            chart_height: default_chart_height(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("public")
}

fn default_file_name() -> String {
    "distribusi-siswa".to_string()
}

fn default_format() -> OutputFormat {
    OutputFormat::Markdown
}

fn default_chart_height() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    16_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Seconds between checks that the report file still exists.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Milliseconds between polls for writes made by other processes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_check_interval() -> u64 {
    2
}

fn default_poll_interval() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.store.backend, BackendKind::File);
        assert_eq!(config.report.file_name, "distribusi-siswa");
        assert!(!config.report.demo_fallback);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
[store]
backend = "postgres"
database_url = "postgres://localhost/sekolah"

[report]
format = "json"
demo_fallback = true

[retry]
max_attempts = 2
"#,
        )
        .unwrap();

        assert_eq!(config.store.backend, BackendKind::Postgres);
        assert_eq!(config.store.path, PathBuf::from("data/sekolah.json"));
        assert_eq!(config.report.format, OutputFormat::Json);
        assert!(config.report.demo_fallback);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.watch.check_interval_secs, 2);
    }

    #[test]
    fn default_toml_lists_sections() {
        let text = Config::default_toml();
        for section in ["[store]", "[report]", "[retry]", "[watch]", "[logging]"] {
            assert!(text.contains(section), "missing {section}");
        }
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
