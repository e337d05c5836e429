use cold_weather_client::domain::Location;
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{collections::HashSet, fs, path::PathBuf, time::Duration};

pub const CONFIG_PATH_ENV: &str = "COLD_WEATHER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "cold-weather-config.toml";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Connection settings for the relational store.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub database: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        let mut opts = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database)
            .options([("statement_timeout", format!("{}s", self.statement_timeout_secs))]);
        if let Some(password) = &self.password {
            opts = opts.password(password);
        }
        opts
    }
}

/// Build a connection pool from explicit settings.
pub async fn connect(cfg: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_secs))
        .connect_with(cfg.connect_options())
        .await
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub forecast_days: Option<u32>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            timeout_secs: default_api_timeout_secs(),
            forecast_days: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default)]
    pub skip_failed_locations: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_fetch_concurrency(),
            skip_failed_locations: false,
            batch_size: default_batch_size(),
            max_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&LocationConfig> for Location {
    fn from(l: &LocationConfig) -> Self {
        Location::new(l.city.clone(), l.latitude, l.longitude)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        use std::env;

        let path: PathBuf = env::var(CONFIG_PATH_ENV)
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
            .into();
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn locations(&self) -> Vec<Location> {
        self.locations.iter().map(Location::from).collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid("pipeline.fetch_concurrency must be >= 1".into()));
        }
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid("pipeline.batch_size must be >= 1".into()));
        }

        let mut seen = HashSet::new();
        for loc in &self.locations {
            if loc.city.trim().is_empty() {
                return Err(ConfigError::Invalid("location city must not be empty".into()));
            }
            if !(-90.0..=90.0).contains(&loc.latitude) {
                return Err(ConfigError::Invalid(format!(
                    "latitude {} for '{}' is outside [-90, 90]",
                    loc.latitude, loc.city
                )));
            }
            if !(-180.0..=180.0).contains(&loc.longitude) {
                return Err(ConfigError::Invalid(format!(
                    "longitude {} for '{}' is outside [-180, 180]",
                    loc.longitude, loc.city
                )));
            }
            if !seen.insert(loc.city.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate location '{}'", loc.city)));
            }
        }

        Ok(())
    }
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5433
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_statement_timeout_secs() -> u64 {
    30
}

fn default_api_base_url() -> String {
    "https://api.open-meteo.com/v1/forecast".to_string()
}

fn default_api_timeout_secs() -> u64 {
    30
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_fetch_concurrency() -> usize {
    1
}

fn default_batch_size() -> usize {
    1000
}

fn default_retry_backoff_ms() -> u64 {
    500
}
