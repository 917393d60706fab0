use log::{debug, warn};
use serde::Deserialize;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SessionError};

/// Response format requested from the tool
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Ask the tool for JSON (`-j`) and pass it through untouched
    #[default]
    Json,
    /// Plain `Key : Value` report, reshaped into a JSON object
    Plain,
}

/// Logging level
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

/// Configuration for the external tool and its supervision
#[derive(Debug, Deserialize, Clone)]
pub struct ToolConfig {
    /// Program to execute, looked up on the execution path
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Extra arguments placed after the batch-mode flags
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Response format
    #[serde(default)]
    pub format: OutputFormat,
    /// Quiet period after which the live process is reclaimed
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// How long shutdown waits for the process to exit before killing it
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Upper bound for a single query; unbounded when absent
    #[serde(default)]
    pub query_timeout_ms: Option<u64>,
    /// Logging level
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_binary() -> String {
    "exiftool".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_shutdown_timeout_ms() -> u64 {
    1_000
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            extra_args: Vec::new(),
            format: OutputFormat::default(),
            idle_timeout_ms: default_idle_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            query_timeout_ms: None,
            log_level: LogLevel::default(),
        }
    }
}

impl ToolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    /// Check values that deserialize fine but make no sense at runtime
    pub fn validate(&self) -> Result<()> {
        if self.binary.trim().is_empty() {
            return Err(SessionError::Config("binary must not be empty".to_string()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(SessionError::Config(
                "idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.query_timeout_ms == Some(0) {
            return Err(SessionError::Config(
                "query_timeout_ms must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where one layer of configuration comes from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// TOML file; skipped with a warning when missing
    File(PathBuf),
    /// Environment variables under a prefix, nested keys split on `__`
    Environment(String),
    /// Inline TOML
    Toml(String),
}

type Layers = config::builder::ConfigBuilder<config::builder::DefaultState>;

impl ConfigSource {
    fn layer(self, layers: Layers) -> Layers {
        match self {
            ConfigSource::File(path) if !path.exists() => {
                warn!("Configuration file not found: {}", path.display());
                layers
            }
            ConfigSource::File(path) => {
                debug!("Reading configuration file {}", path.display());
                layers.add_source(config::File::from(path).format(config::FileFormat::Toml))
            }
            ConfigSource::Environment(prefix) => {
                debug!("Reading configuration from {}__* variables", prefix);
                layers.add_source(
                    config::Environment::with_prefix(&prefix)
                        .separator("__")
                        .try_parsing(true),
                )
            }
            ConfigSource::Toml(text) => {
                layers.add_source(config::File::from_str(&text, config::FileFormat::Toml))
            }
        }
    }
}

/// Merge `sources` in order, later layers overriding earlier ones
///
/// Fields no layer sets take their serde defaults.
pub fn load_config<T>(sources: Vec<ConfigSource>) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    let merged = sources
        .into_iter()
        .fold(config::Config::builder(), |layers, source| source.layer(layers))
        .build()
        .map_err(|e| SessionError::Config(format!("cannot merge configuration: {}", e)))?;

    let result = merged
        .try_deserialize()
        .map_err(|e| SessionError::Config(format!("invalid configuration: {}", e)))?;

    debug!("Loaded configuration: {:?}", result);
    Ok(result)
}

/// Configuration builder
pub struct ConfigBuilder<T: for<'de> Deserialize<'de>> {
    sources: Vec<ConfigSource>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: for<'de> Deserialize<'de> + Debug> ConfigBuilder<T> {
    /// Create a new config builder
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Add a TOML file source
    pub fn add_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.sources.push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add environment variables
    pub fn add_env(mut self, prefix: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Environment(prefix.into()));
        self
    }

    /// Add TOML string
    pub fn add_toml(mut self, toml: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Toml(toml.into()));
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<T> {
        load_config::<T>(self.sources)
    }
}

impl<T: for<'de> Deserialize<'de> + Debug> Default for ConfigBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
