//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 3000,
        }
    }
}

/// Metadata store database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    pub require_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            max_pool_size: 10,
            require_tls: false,
        }
    }
}

/// How an engine action's status is written to the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusEncoding {
    /// Status is a plain typed property on the element
    Property,
    /// Status is also carried by a classification on the element
    Classification,
}

impl Default for StatusEncoding {
    fn default() -> Self {
        StatusEncoding::Property
    }
}

impl std::str::FromStr for StatusEncoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "property" => Ok(StatusEncoding::Property),
            "classification" => Ok(StatusEncoding::Classification),
            other => Err(ConfigError::InvalidValue(format!(
                "Unknown status encoding '{}' (expected property or classification)",
                other
            ))),
        }
    }
}

/// Engine host configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Identity written into the processing engine field when claiming
    pub engine_guid: String,
    pub engine_name: String,
    /// Number of engine actions executed concurrently by this host
    pub task_slots: usize,
    pub poll_interval_ms: u64,
    /// Maximum candidates inspected per poll
    pub poll_batch_size: usize,
    pub enabled: bool,
    pub status_encoding: StatusEncoding,
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_guid: Uuid::new_v4().to_string(),
            engine_name: "governance-engine".to_string(),
            task_slots: 4,
            poll_interval_ms: 1000,
            poll_batch_size: 50,
            enabled: true,
            status_encoding: StatusEncoding::Property,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    /// Absent when the in-memory metadata store should be used
    pub database: Option<DatabaseConfig>,
    pub engine: EngineConfig,
    pub cors: CorsConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: None,
            engine: EngineConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: std::env::var("HOST")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let database = match std::env::var("DATABASE_URL") {
            Ok(database_url) if !database_url.trim().is_empty() => {
                Some(Self::parse_database_url(&database_url)?)
            }
            _ => None,
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            engine_guid: std::env::var("ENGINE_GUID")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.engine_guid),
            engine_name: std::env::var("ENGINE_NAME").unwrap_or(defaults.engine_name),
            task_slots: parse_var("ENGINE_TASK_SLOTS")?.unwrap_or(defaults.task_slots),
            poll_interval_ms: parse_var("ENGINE_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval_ms),
            poll_batch_size: parse_var("ENGINE_POLL_BATCH_SIZE")?
                .unwrap_or(defaults.poll_batch_size),
            enabled: parse_var("ENGINE_ENABLED")?.unwrap_or(defaults.enabled),
            status_encoding: parse_var("ENGINE_STATUS_ENCODING")?
                .unwrap_or(defaults.status_encoding),
        };

        if engine.task_slots == 0 {
            return Err(ConfigError::InvalidValue(
                "ENGINE_TASK_SLOTS must be at least 1".to_string(),
            ));
        }

        let cors = CorsConfig {
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        Ok(Self {
            server,
            database,
            engine,
            cors,
        })
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(url: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue(
                "Missing database name in DATABASE_URL".to_string(),
            ));
        }

        let require_tls = parsed
            .query_pairs()
            .any(|(k, v)| k == "sslmode" && matches!(v.as_ref(), "require" | "verify-ca" | "verify-full"));

        Ok(DatabaseConfig {
            host,
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            database,
            max_pool_size: parse_var("DB_MAX_CONNECTIONS")?.unwrap_or(10),
            require_tls,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::ParseError(format!("{} has an invalid value '{}'", name, raw))),
        _ => Ok(None),
    }
}
