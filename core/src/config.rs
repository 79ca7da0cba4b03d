use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub request_timeout_secs: u64,
    /// Page size used when scanning existing documents.
    pub scan_page_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Logical operations per bulk chunk.
    pub chunk_size: usize,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        // Load default configuration
        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        // Layer on config file if it exists
        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        // Layer on environment variables (DOCSYNC_ prefix)
        builder = builder.add_source(
            Environment::with_prefix("DOCSYNC")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let settings: Config = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.url.is_empty() {
            return Err(ConfigError::Message("store.url is required".into()));
        }

        if self.sync.chunk_size == 0 {
            return Err(ConfigError::Message(
                "sync.chunk_size must be greater than 0".into(),
            ));
        }

        if self.sync.channel_capacity == 0 {
            return Err(ConfigError::Message(
                "sync.channel_capacity must be greater than 0".into(),
            ));
        }

        if self.store.scan_page_size == 0 {
            return Err(ConfigError::Message(
                "store.scan_page_size must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                url: "http://localhost:9200".to_string(),
                username: "elastic".to_string(),
                password: "changeme".to_string(),
                request_timeout_secs: 30,
                scan_page_size: 1000,
            },
            sync: SyncConfig {
                chunk_size: 500,
                channel_capacity: 1024,
            },
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
                metrics_enabled: false,
                metrics_port: 9090,
            },
        }
    }
}
