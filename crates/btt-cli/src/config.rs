//! Configuration loading and management.

use std::path::{Path, PathBuf};

use btt_core::parser::{DEFAULT_MAX_LINE_BYTES, DEFAULT_MAX_TOTAL_BYTES};
use btt_core::{ParseOptions, TimestampUnit};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Project name used for events when no repository is known.
const DEFAULT_PROJECT_NAME: &str = "buildtime-trend";

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the Travis CI API.
    pub api_url: String,
    /// JSON lines file that submitted events are appended to.
    pub events_path: PathBuf,
    pub max_line_bytes: usize,
    /// Upper bound for a single job log, local or downloaded.
    pub max_log_bytes: u64,
    pub flush_unterminated: bool,
    pub timestamp_unit: TimestampUnit,
    pub project_name: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            api_url: btt_travis::TRAVIS_ORG_API_URL.to_string(),
            events_path: data_dir.join("events.jsonl"),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_log_bytes: DEFAULT_MAX_TOTAL_BYTES,
            flush_unterminated: true,
            timestamp_unit: TimestampUnit::Auto,
            project_name: DEFAULT_PROJECT_NAME.to_string(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // BTT_API_URL, BTT_MAX_LOG_BYTES, ...
        figment = figment.merge(Env::prefixed("BTT_"));

        figment.extract()
    }

    /// Parser settings derived from this configuration.
    pub const fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            max_line_bytes: self.max_line_bytes,
            max_total_bytes: self.max_log_bytes,
            flush_unterminated: self.flush_unterminated,
            timestamp_unit: self.timestamp_unit,
        }
    }
}

/// Returns the platform-specific config directory for btt.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("btt"))
}

/// Returns the platform-specific data directory for btt.
///
/// On Linux: `~/.local/share/btt`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("btt"))
}
