use crate::error::ServerError;
use hangar_common::dataset::is_plain_identifier;
use hangar_common::DatasetDef;
use hangar_engine::EngineOptions;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub datasets: Vec<DatasetDef>,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Include the engine's error text in errors returned to clients.
    #[serde(default)]
    pub expose_engine_errors: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_max_concurrent_statements")]
    pub max_concurrent_statements: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSettings {
    /// How many batches a DoGet producer may run ahead of the transport.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_max_concurrent_statements() -> usize {
    16
}

fn default_channel_capacity() -> usize {
    2
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_statements: default_max_concurrent_statements(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or `HANGAR_CONFIG_PATH`, or
    /// `config/default.toml`, with `HANGAR__*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ServerError> {
        let config_file_path = match path {
            Some(path) => path.to_string(),
            None => std::env::var("HANGAR_CONFIG_PATH")
                .unwrap_or_else(|_| "config/default.toml".to_string()),
        };

        let s = config::Config::builder()
            .add_source(config::File::with_name(&config_file_path).required(true))
            .add_source(
                config::Environment::with_prefix("HANGAR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings from TOML text, without environment overrides.
    pub fn from_toml(raw: &str) -> Result<Self, ServerError> {
        let s = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?;
        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings with defaults and no datasets, bound to `host:port`.
    pub fn for_address(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            datasets: Vec::new(),
            engine: EngineSettings::default(),
            stream: StreamSettings::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            expose_engine_errors: false,
        }
    }

    pub fn with_dataset(mut self, dataset: DatasetDef) -> Self {
        self.datasets.push(dataset);
        self
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        let mut seen = HashSet::new();
        for dataset in &self.datasets {
            if !is_plain_identifier(&dataset.name) {
                return Err(ServerError::InvalidConfig(format!(
                    "dataset name '{}' must be a plain SQL identifier",
                    dataset.name
                )));
            }
            if !seen.insert(dataset.name.as_str()) {
                return Err(ServerError::InvalidConfig(format!(
                    "dataset '{}' is configured more than once",
                    dataset.name
                )));
            }
        }
        if self.stream.channel_capacity == 0 {
            return Err(ServerError::InvalidConfig(
                "stream.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.engine.max_concurrent_statements == 0 {
            return Err(ServerError::InvalidConfig(
                "engine.max_concurrent_statements must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn server_address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn dataset_names(&self) -> impl Iterator<Item = &str> {
        self.datasets.iter().map(|d| d.name.as_str())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_concurrent_statements: self.engine.max_concurrent_statements,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
