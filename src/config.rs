//! Configuration for the worker-loop server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::dispatch::MessageType;
use crate::runtime::{
    DEFAULT_DELAY_CHECK_INTERVAL, DEFAULT_MAX_IO_HANDLERS, DEFAULT_REQUESTS_PER_ITERATION,
    DEFAULT_TASK_QUEUE_CAPACITY, NUM_PRIORITIES,
};
use crate::settings::{num_cpus, Settings};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug, Default)]
#[command(name = "worker-loop")]
#[command(version)]
#[command(about = "Worker event loops with permission-gated message dispatch", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Stop after this many seconds (runs until killed if unset)
    #[arg(long)]
    pub run_for: Option<u64>,

    /// Seconds between worker delay reports
    #[arg(long)]
    pub stats_interval: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub event_loop: EventLoopConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool configuration
#[derive(Debug, Deserialize, Default)]
pub struct WorkersConfig {
    /// Number of worker threads
    pub count: Option<usize>,
    /// Seconds between worker delay reports
    pub stats_interval: Option<u64>,
}

/// Per-loop configuration
#[derive(Debug, Deserialize)]
pub struct EventLoopConfig {
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,
    #[serde(default = "default_true")]
    pub enable_priority_queues: bool,
    /// Tasks run per iteration for the High, Medium and Low lanes
    #[serde(default = "default_requests_per_iteration")]
    pub requests_per_iteration: [u32; NUM_PRIORITIES],
    #[serde(default = "default_delay_check_interval_ms")]
    pub delay_check_interval_ms: u64,
    #[serde(default = "default_max_io_handlers")]
    pub max_io_handlers: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            task_queue_capacity: default_task_queue_capacity(),
            enable_priority_queues: true,
            requests_per_iteration: default_requests_per_iteration(),
            delay_check_interval_ms: default_delay_check_interval_ms(),
            max_io_handlers: default_max_io_handlers(),
        }
    }
}

/// Authorization configuration
#[derive(Debug, Deserialize, Default)]
pub struct SecurityConfig {
    /// Message types checked against the ACL
    #[serde(default)]
    pub require_permission_message_types: BTreeSet<MessageType>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_task_queue_capacity() -> usize {
    DEFAULT_TASK_QUEUE_CAPACITY
}

fn default_true() -> bool {
    true
}

fn default_requests_per_iteration() -> [u32; NUM_PRIORITIES] {
    DEFAULT_REQUESTS_PER_ITERATION
}

fn default_delay_check_interval_ms() -> u64 {
    DEFAULT_DELAY_CHECK_INTERVAL.as_millis() as u64
}

fn default_max_io_handlers() -> usize {
    DEFAULT_MAX_IO_HANDLERS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    10
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub task_queue_capacity: usize,
    pub enable_priority_queues: bool,
    pub requests_per_iteration: [u32; NUM_PRIORITIES],
    pub delay_check_interval: Duration,
    pub max_io_handlers: usize,
    pub require_permission_message_types: BTreeSet<MessageType>,
    pub log_level: String,
    pub run_for: Option<Duration>,
    pub stats_interval: Duration,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::from_parts(cli, toml_config)
    }

    /// Merge parsed CLI args over a parsed TOML file and validate the result.
    pub fn from_parts(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let workers = cli
            .workers
            .or(toml_config.workers.count)
            .unwrap_or_else(num_cpus);
        if workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }

        let event_loop = toml_config.event_loop;
        if event_loop.task_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_loop.task_queue_capacity must be at least 1".into(),
            ));
        }
        if event_loop.requests_per_iteration.contains(&0) {
            return Err(ConfigError::Invalid(
                "event_loop.requests_per_iteration entries must be at least 1".into(),
            ));
        }
        if event_loop.delay_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "event_loop.delay_check_interval_ms must be at least 1".into(),
            ));
        }

        let stats_interval = cli
            .stats_interval
            .or(toml_config.workers.stats_interval)
            .unwrap_or_else(default_stats_interval);
        if stats_interval == 0 {
            return Err(ConfigError::Invalid("stats interval must be at least 1 second".into()));
        }

        Ok(Config {
            workers,
            task_queue_capacity: event_loop.task_queue_capacity,
            enable_priority_queues: event_loop.enable_priority_queues,
            requests_per_iteration: event_loop.requests_per_iteration,
            delay_check_interval: Duration::from_millis(event_loop.delay_check_interval_ms),
            max_io_handlers: event_loop.max_io_handlers,
            require_permission_message_types: toml_config.security.require_permission_message_types,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            run_for: cli.run_for.map(Duration::from_secs),
            stats_interval: Duration::from_secs(stats_interval),
        })
    }

    /// Settings snapshot for the processor.
    pub fn to_settings(&self) -> Settings {
        Settings {
            num_workers: self.workers,
            task_queue_capacity: self.task_queue_capacity,
            enable_priority_queues: self.enable_priority_queues,
            requests_per_iteration: self.requests_per_iteration,
            delay_check_interval: self.delay_check_interval,
            max_io_handlers: self.max_io_handlers,
            require_permission_message_types: self.require_permission_message_types.clone(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.workers.count, None);
        assert_eq!(config.event_loop.task_queue_capacity, 1024);
        assert_eq!(config.event_loop.requests_per_iteration, [13, 3, 1]);
        assert_eq!(config.event_loop.delay_check_interval_ms, 1000);
        assert!(config.security.require_permission_message_types.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [workers]
            count = 4

            [event_loop]
            task_queue_capacity = 256
            enable_priority_queues = false
            requests_per_iteration = [8, 4, 2]
            delay_check_interval_ms = 250

            [security]
            require_permission_message_types = ["APPEND", "TRIM", "GET_TRIM_POINT"]

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workers.count, Some(4));
        assert_eq!(config.event_loop.task_queue_capacity, 256);
        assert!(!config.event_loop.enable_priority_queues);
        assert_eq!(config.event_loop.requests_per_iteration, [8, 4, 2]);
        assert_eq!(config.event_loop.max_io_handlers, 10_000);
        assert_eq!(
            config.security.require_permission_message_types,
            [MessageType::Append, MessageType::Trim, MessageType::GetTrimPoint]
                .into_iter()
                .collect()
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let toml_str = r#"
            [security]
            require_permission_message_types = ["NOT_A_TYPE"]
        "#;
        assert!(toml::from_str::<TomlConfig>(toml_str).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [workers]
            count = 4
            stats_interval = 30

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();
        let cli = CliArgs {
            workers: Some(2),
            log_level: Some("trace".into()),
            run_for: Some(5),
            ..CliArgs::default()
        };

        let config = Config::from_parts(cli, toml_config).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.run_for, Some(Duration::from_secs(5)));
        assert_eq!(config.stats_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cli = CliArgs {
            workers: Some(0),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::from_parts(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        let toml_config: TomlConfig = toml::from_str(
            r#"
            [event_loop]
            requests_per_iteration = [1, 0, 1]
        "#,
        )
        .unwrap();
        assert!(matches!(
            Config::from_parts(CliArgs::default(), toml_config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_to_settings() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [workers]
            count = 3

            [security]
            require_permission_message_types = ["TRIM"]
        "#,
        )
        .unwrap();
        let settings = Config::from_parts(CliArgs::default(), toml_config)
            .unwrap()
            .to_settings();
        assert_eq!(settings.num_workers, 3);
        assert!(settings.requires_permission(MessageType::Trim));
        assert!(!settings.requires_permission(MessageType::Append));
    }
}
