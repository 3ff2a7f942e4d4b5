use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub ingest: IngestConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub name: String,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub datasets: Vec<DatasetConfig>,
    pub page_size: u64,
    pub correction_window_days: i64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_concurrent_datasets: usize,
    pub max_concurrent_months: usize,
}

/// One remote dataset and the collection it feeds. Immutable after load.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetConfig {
    pub id: String,
    pub collection: String,
    pub date_field: String,
    pub region_field: Option<String>,
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

// The catalog rejects pages larger than this.
pub const REMOTE_MAX_PAGE_SIZE: u64 = 100;

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        // Load default configuration
        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        // Layer on config file if it exists
        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        // Layer on environment variables (COLLECTOR_ prefix)
        builder = builder.add_source(
            Environment::with_prefix("COLLECTOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let settings: Config = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Message("database.url is required".into()));
        }

        if self.database.name.is_empty() {
            return Err(ConfigError::Message("database.name is required".into()));
        }

        if self.api.base_url.is_empty() {
            return Err(ConfigError::Message("api.base_url is required".into()));
        }

        if self.api.requests_per_second == 0 {
            return Err(ConfigError::Message(
                "api.requests_per_second must be greater than 0".into(),
            ));
        }

        if self.ingest.page_size == 0 || self.ingest.page_size > REMOTE_MAX_PAGE_SIZE {
            return Err(ConfigError::Message(format!(
                "ingest.page_size must be between 1 and {}",
                REMOTE_MAX_PAGE_SIZE
            )));
        }

        if self.ingest.datasets.is_empty() {
            return Err(ConfigError::Message(
                "ingest.datasets must not be empty".into(),
            ));
        }

        if self.ingest.correction_window_days < 0 {
            return Err(ConfigError::Message(
                "ingest.correction_window_days must not be negative".into(),
            ));
        }

        if self.ingest.max_concurrent_datasets == 0 || self.ingest.max_concurrent_months == 0 {
            return Err(ConfigError::Message(
                "ingest concurrency bounds must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "mongodb://localhost:27017".to_string(),
                name: "eco2mix".to_string(),
                connect_timeout_secs: 10,
            },
            api: ApiConfig {
                base_url: "https://odre.opendatasoft.com/api/explore/v2.1/catalog/datasets/"
                    .to_string(),
                request_timeout_secs: 30,
                requests_per_second: 10,
            },
            ingest: IngestConfig {
                datasets: vec![
                    DatasetConfig {
                        id: "eco2mix-national-tr".to_string(),
                        collection: "DonneesNationales".to_string(),
                        date_field: "date".to_string(),
                        region_field: None,
                    },
                    DatasetConfig {
                        id: "eco2mix-regional-tr".to_string(),
                        collection: "DonneesRegionales".to_string(),
                        date_field: "date".to_string(),
                        region_field: Some("libelle_region".to_string()),
                    },
                ],
                page_size: 100,
                correction_window_days: 3,
                max_retries: 5,
                retry_base_delay_ms: 1000,
                max_concurrent_datasets: 4,
                max_concurrent_months: 8,
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
