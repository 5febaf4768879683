//! Configuration module for ledger-sync-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncServiceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Upstream provider credentials and endpoint selection.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client_id: String,
    pub secret: Secret<String>,
    /// Environment tier (`sandbox`, `development`, `production`).
    pub environment: String,
    pub base_url: String,
    pub timeout: Duration,
    pub client_name: String,
    pub country_codes: Vec<String>,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Run a background loop per connection. Manual triggers work either way.
    pub enabled: bool,
    pub interval: Duration,
    pub max_pages_per_pass: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub eligible_account_types: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            max_pages_per_pass: 100,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(1800),
            eligible_account_types: vec!["depository".to_string()],
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        let environment = env::var("PLAID_ENV").unwrap_or_else(|_| "sandbox".to_string());
        let base_url = env::var("PLAID_BASE_URL")
            .unwrap_or_else(|_| format!("https://{}.plaid.com", environment));

        Self {
            client_id: env::var("PLAID_CLIENT_ID").unwrap_or_default(),
            secret: Secret::new(env::var("PLAID_SECRET").unwrap_or_default()),
            environment,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(parse_env("PLAID_TIMEOUT_SECS", 30)),
            client_name: env::var("PLAID_CLIENT_NAME")
                .unwrap_or_else(|_| "Budget Tracker".to_string()),
            country_codes: list_env("PLAID_COUNTRY_CODES", &["US"]),
            language: env::var("PLAID_LANGUAGE").unwrap_or_else(|_| "en".to_string()),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: parse_env("SYNC_ENABLED", defaults.enabled),
            interval: Duration::from_secs(parse_env(
                "SYNC_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )),
            max_pages_per_pass: parse_env("SYNC_MAX_PAGES_PER_PASS", defaults.max_pages_per_pass),
            initial_backoff: Duration::from_secs(parse_env(
                "SYNC_INITIAL_BACKOFF_SECS",
                defaults.initial_backoff.as_secs(),
            )),
            max_backoff: Duration::from_secs(parse_env(
                "SYNC_MAX_BACKOFF_SECS",
                defaults.max_backoff.as_secs(),
            )),
            eligible_account_types: list_env("SYNC_ELIGIBLE_ACCOUNT_TYPES", &["depository"]),
        }
    }
}

impl SyncServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let config = Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "ledger-sync-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://ledger.db".to_string()),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 5),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 1),
            },
            provider: ProviderConfig::from_env(),
            sync: SyncConfig::from_env(),
        };

        if config.sync.max_pages_per_pass == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SYNC_MAX_PAGES_PER_PASS must be at least 1"
            )));
        }

        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn list_env(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}
