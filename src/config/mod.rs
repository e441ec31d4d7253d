//! Rule service configuration
//!
//! Configuration is read from a JSON file; every field has a default, and a
//! couple of environment variables override the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{AccessRuleError, RuleResult};
use crate::service::COMMAND_CHANNEL_SIZE;
use crate::storage::DEFAULT_RULES_PATH;

/// Environment variable overriding the rule file path
pub const ENV_DB_PATH: &str = "PROMPT_RULES_DB";

/// Environment variable enabling file logging into a directory
pub const ENV_LOG_DIR: &str = "PROMPT_RULES_LOG_DIR";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for daily rolling JSON log files; none logs to stderr only
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// File name prefix of the rolling log files
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_file_prefix() -> String {
    "prompt-rules.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            log_dir: None,
            file_prefix: default_file_prefix(),
        }
    }
}

impl LoggingConfig {
    /// Set the default level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Also log to files in `dir`
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Path of the JSON rule file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Logging setup
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Buffer size of the rule service command channel
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_RULES_PATH)
}

fn default_channel_size() -> usize {
    COMMAND_CHANNEL_SIZE
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            logging: LoggingConfig::default(),
            channel_size: default_channel_size(),
        }
    }
}

impl RulesConfig {
    /// Load a configuration file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> RuleResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)?;
        let config = config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Apply `PROMPT_RULES_DB` and `PROMPT_RULES_LOG_DIR`
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup(ENV_DB_PATH).filter(|v| !v.is_empty()) {
            self.db_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup(ENV_LOG_DIR).filter(|v| !v.is_empty()) {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Check the values make sense
    pub fn validate(&self) -> RuleResult<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(AccessRuleError::InvalidConfig("db_path must not be empty".into()));
        }
        if self.channel_size == 0 {
            return Err(AccessRuleError::InvalidConfig("channel_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Set the rule file path
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Set the logging configuration
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Set the command channel size
    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }
}
