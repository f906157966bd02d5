use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use teloxide::types::UserId;

use crate::sanitize::FormatMode;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    /// API key for the remote inference endpoint.
    api_key: String,
    /// Chat completions endpoint.
    #[serde(default = "default_api_url")]
    api_url: String,
    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    model: String,
    /// User who receives feedback notifications. Can also be claimed at
    /// runtime via /setadmin.
    admin_id: Option<u64>,
    /// How model replies are prepared for Telegram.
    #[serde(default)]
    formatting_mode: FormatMode,
    /// Cap on simultaneous outbound model requests.
    #[serde(default = "default_max_concurrent")]
    max_concurrent_requests: usize,
    /// Directory for state files (database, tasks, logs). Defaults to the
    /// current directory.
    data_dir: Option<String>,
}

fn default_api_url() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "deepseek/deepseek-r1".to_string()
}

fn default_max_concurrent() -> usize {
    10
}

pub struct Config {
    pub telegram_bot_token: String,
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub admin_id: Option<UserId>,
    pub formatting_mode: FormatMode,
    pub max_concurrent_requests: usize,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }
        if file.api_key.is_empty() {
            return Err(ConfigError::Validation("api_key is required".into()));
        }
        if file.max_concurrent_requests == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            api_key: file.api_key,
            api_url: file.api_url,
            model: file.model,
            admin_id: file.admin_id.map(UserId),
            formatting_mode: file.formatting_mode,
            max_concurrent_requests: file.max_concurrent_requests,
            data_dir,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("interactions.db")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.data_dir.join("tasks.txt")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("unplug.log")
    }
}
