//! Configuration management.
//!
//! flowline configuration can come from:
//! - Config file (~/.config/flowline/config.toml)
//! - Environment variables (FLOWLINE_*), which win over the file

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{RunPolicy, SchedulerOptions};
use crate::error::{Error, Result};
use crate::events::{DEFAULT_BACKLOG, DEFAULT_HISTORY};
use crate::flow::FlowConfig;

/// flowline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduler defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retries for flows that do not set their own
    pub default_retries: u32,

    pub default_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Default node timeout; 0 disables it
    pub default_timeout_ms: u64,

    /// How long cancelled capabilities get before they are aborted
    pub grace_period_ms: u64,

    /// Events each run keeps for replay
    pub event_history: usize,

    /// Unread events a subscriber may fall behind by
    pub subscriber_backlog: usize,

    pub run_policy: RunPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let flow = FlowConfig::default();
        Self {
            default_retries: flow.retries,
            default_backoff_ms: flow.backoff.as_millis() as u64,
            max_backoff_ms: flow.max_backoff.as_millis() as u64,
            default_timeout_ms: 0,
            grace_period_ms: 5_000,
            event_history: DEFAULT_HISTORY,
            subscriber_backlog: DEFAULT_BACKLOG,
            run_policy: RunPolicy::default(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub filter: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "flowline=info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from default locations. An unreadable or invalid
    /// config file is ignored.
    pub fn load() -> Self {
        let mut config = Self::default();

        let path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load an explicit config file. Unlike [`load`](Self::load), a missing
    /// or malformed file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.apply_partial(Self::load_partial_from_path(path)?);
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("flowline"))
            .unwrap_or_else(|| PathBuf::from(".flowline"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("flowline"))
            .unwrap_or_else(|| PathBuf::from(".flowline"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("flowline.db"))
    }

    /// Scheduler options derived from the engine section.
    pub fn scheduler_options(&self) -> SchedulerOptions {
        let engine = &self.engine;
        SchedulerOptions {
            grace_period: Duration::from_millis(engine.grace_period_ms),
            history_capacity: engine.event_history,
            subscriber_backlog: engine.subscriber_backlog.max(1),
            run_policy: engine.run_policy,
            flow_defaults: FlowConfig {
                retries: engine.default_retries,
                timeout: (engine.default_timeout_ms > 0)
                    .then(|| Duration::from_millis(engine.default_timeout_ms)),
                backoff: Duration::from_millis(engine.default_backoff_ms),
                max_backoff: Duration::from_millis(engine.max_backoff_ms),
            },
        }
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        if let Some(path) = var("FLOWLINE_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(retries) = parsed(var("FLOWLINE_DEFAULT_RETRIES")) {
            self.engine.default_retries = retries;
        }
        if let Some(ms) = parsed(var("FLOWLINE_DEFAULT_BACKOFF_MS")) {
            self.engine.default_backoff_ms = ms;
        }
        if let Some(ms) = parsed(var("FLOWLINE_DEFAULT_TIMEOUT_MS")) {
            self.engine.default_timeout_ms = ms;
        }
        if let Some(ms) = parsed(var("FLOWLINE_GRACE_PERIOD_MS")) {
            self.engine.grace_period_ms = ms;
        }
        match var("FLOWLINE_RUN_POLICY").as_deref() {
            Some("fail_on_any_failure") => self.engine.run_policy = RunPolicy::FailOnAnyFailure,
            Some("allow_partial_success") => {
                self.engine.run_policy = RunPolicy::AllowPartialSuccess
            }
            _ => {}
        }
        if let Some(filter) = var("FLOWLINE_LOG") {
            self.logging.filter = filter;
        }
        match var("FLOWLINE_LOG_FORMAT").as_deref() {
            Some("json") => self.logging.format = LogFormat::Json,
            Some("pretty") => self.logging.format = LogFormat::Pretty,
            _ => {}
        }
    }

    fn load_partial_from_path(path: &Path) -> Result<PartialConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(logging) = partial.logging {
            self.logging = logging;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    engine: Option<EngineConfig>,
    storage: Option<StorageConfig>,
    logging: Option<LoggingConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_tables_keep_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[engine]
default_retries = 2
run_policy = "allow_partial_success"

[logging]
format = "json"
"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_partial(Config::load_partial_from_path(&path).unwrap());

        assert_eq!(config.engine.default_retries, 2);
        assert_eq!(config.engine.run_policy, RunPolicy::AllowPartialSuccess);
        assert_eq!(config.engine.grace_period_ms, 5_000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.filter, "flowline=info");
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("FLOWLINE_DATABASE_PATH", "/tmp/flows.db"),
            ("FLOWLINE_DEFAULT_RETRIES", "4"),
            ("FLOWLINE_GRACE_PERIOD_MS", "not-a-number"),
            ("FLOWLINE_RUN_POLICY", "allow_partial_success"),
            ("FLOWLINE_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database_path(), PathBuf::from("/tmp/flows.db"));
        assert_eq!(config.engine.default_retries, 4);
        assert_eq!(config.engine.grace_period_ms, 5_000);
        assert_eq!(config.engine.run_policy, RunPolicy::AllowPartialSuccess);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_scheduler_options() {
        let mut config = Config::default();
        config.engine.default_retries = 3;
        config.engine.default_timeout_ms = 1_500;
        config.engine.grace_period_ms = 250;

        let options = config.scheduler_options();
        assert_eq!(options.grace_period, Duration::from_millis(250));
        assert_eq!(options.flow_defaults.retries, 3);
        assert_eq!(options.flow_defaults.timeout, Some(Duration::from_millis(1_500)));
        assert_eq!(options.flow_defaults.backoff, Duration::from_secs(1));

        config.engine.default_timeout_ms = 0;
        assert_eq!(config.scheduler_options().flow_defaults.timeout, None);
    }

    #[test]
    fn test_load_from_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_from(&dir.path().join("missing.toml")).is_err());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[engine]\ndefault_retries = \"many\"\n").unwrap();
        let err = Config::load_from(&bad).unwrap_err();
        assert_eq!(err.code(), "TOML_ERROR");
    }
}
