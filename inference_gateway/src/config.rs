use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub inference: InferenceConfig,
    #[serde(default)]
    pub frames: FramesConfig,
    pub storage: StorageConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remote inference backend and the batch fan-out policy.
#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_max_batch_frames")]
    pub max_batch_frames: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_max_batch_frames() -> usize {
    100_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_keep_alive_secs() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    64 * 1024 * 1024
}

impl InferenceConfig {
    pub fn get_address(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FramesConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for FramesConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_buffer_size() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub video_root: PathBuf,
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

impl Validatable for InferenceConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_requests == 0 {
            return Err("inference.max_concurrent_requests must be at least 1".to_string());
        }
        if self.max_batch_frames == 0 {
            return Err("inference.max_batch_frames must be at least 1".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("inference.timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Validatable for FramesConfig {
    fn validate(&self) -> Result<(), String> {
        if self.buffer_size == 0 {
            return Err("frames.buffer_size must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Validatable for StorageConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.video_root.is_dir() {
            return Err(format!("Video root not found: {:?}", self.video_root));
        }
        Ok(())
    }
}

impl Validatable for Config {
    fn validate(&self) -> Result<(), String> {
        self.inference.validate()?;
        self.frames.validate()?;
        self.storage.validate()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "{} is not a supported minimum log level. Use `debug`, `info` or `warn`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("IG")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
