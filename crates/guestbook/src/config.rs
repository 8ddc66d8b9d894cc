//! Guestbook configuration

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use wish_store::SupabaseConfig;

/// Guestbook configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestbookConfig {
    /// Supabase project URL
    #[serde(default)]
    pub supabase_url: Option<String>,

    /// Supabase anonymous key
    #[serde(default)]
    pub supabase_anon_key: Option<String>,

    /// Table holding the entries
    #[serde(default = "default_table")]
    pub table: String,

    /// Realtime channel name
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Directory for the local fallback storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Timeout for remote requests in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_table() -> String {
    "wishes".to_string()
}

fn default_channel() -> String {
    "wishes-realtime".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("guestbook"))
        .unwrap_or_else(|| PathBuf::from(".guestbook"))
}

fn default_request_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GuestbookConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_anon_key: None,
            table: default_table(),
            channel: default_channel(),
            data_dir: default_data_dir(),
            request_timeout_secs: default_request_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl GuestbookConfig {
    /// Load configuration from the optional config file and the environment
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let base = match Self::find_config_file() {
            Some(path) => {
                let contents = std::fs::read_to_string(&path)?;
                toml::from_str(&contents)?
            }
            None => Self::default(),
        };

        Ok(base.with_env(|key| std::env::var(key).ok()))
    }

    /// Overrides fields with values from `lookup` (environment takes
    /// precedence over the config file)
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let first = |keys: &[&str]| keys.iter().find_map(|key| lookup(*key));

        if let Some(url) = first(&["GUESTBOOK_SUPABASE_URL", "VITE_SUPABASE_URL"]) {
            self.supabase_url = Some(url);
        }

        if let Some(key) = first(&["GUESTBOOK_SUPABASE_ANON_KEY", "VITE_SUPABASE_ANON_KEY"]) {
            self.supabase_anon_key = Some(key);
        }

        if let Some(table) = lookup("GUESTBOOK_TABLE") {
            self.table = table;
        }

        if let Some(channel) = lookup("GUESTBOOK_CHANNEL") {
            self.channel = channel;
        }

        if let Some(dir) = lookup("GUESTBOOK_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(timeout) = lookup("GUESTBOOK_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = timeout.parse().unwrap_or(default_request_timeout());
        }

        if let Some(level) = lookup("GUESTBOOK_LOG_LEVEL") {
            self.log_level = level;
        }

        self
    }

    /// Find the config file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let locations = [
            PathBuf::from("guestbook.toml"),
            dirs::config_dir()
                .map(|p| p.join("guestbook").join("guestbook.toml"))
                .unwrap_or_default(),
        ];

        locations.into_iter().find(|p| p.is_file())
    }

    /// Remote store settings, or `None` when the remote store is not
    /// configured
    pub fn supabase(&self) -> Option<SupabaseConfig> {
        let url = self.supabase_url.as_deref().map(str::trim).unwrap_or("");
        let key = self.supabase_anon_key.as_deref().map(str::trim).unwrap_or("");
        if url.is_empty() || key.is_empty() {
            return None;
        }

        Some(SupabaseConfig {
            url: url.to_string(),
            anon_key: key.to_string(),
            table: self.table.clone(),
            channel: self.channel.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
