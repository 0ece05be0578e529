//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

use crate::federation::keys::DEFAULT_KEY_BITS;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    pub actor: ActorConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "diary.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
    /// Timeout applied to inbound requests
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout_seconds() -> u64 {
    30
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://diary.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub title: String,
    pub description: String,
}

/// The local author, as handed over by the publishing platform
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    /// Local username (default: "admin")
    #[serde(default = "default_actor_username")]
    pub username: String,
    /// Display name (default: "Admin")
    #[serde(default = "default_actor_display_name")]
    pub display_name: String,
    /// Profile summary
    #[serde(default)]
    pub summary: String,
    /// Avatar URL
    pub icon_url: Option<String>,
}

fn default_actor_username() -> String {
    "admin".to_string()
}

fn default_actor_display_name() -> String {
    "Admin".to_string()
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// RSA modulus size for generated keys
    pub key_bits: usize,
    /// Accepted distance between a request's Date header and now
    pub clock_skew_seconds: i64,
    /// How long a fetched remote actor is trusted before refetching
    pub actor_cache_ttl_seconds: u64,
    /// Items per page in followers/outbox collections
    pub collection_page_size: u32,
    /// Permit remote fetches to loopback/private hosts (tests, LAN setups)
    #[serde(default)]
    pub allow_private_addresses: bool,
    pub delivery: DeliveryConfig,
}

impl FederationConfig {
    pub fn actor_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_cache_ttl_seconds)
    }
}

/// Outbound delivery tuning
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Parallel deliveries per fan-out
    pub max_concurrency: usize,
    /// Per-attempt timeout
    pub timeout_seconds: u64,
    /// Attempts per inbox before the delivery is dropped
    pub max_attempts: u32,
    /// First retry delay; doubles on every attempt
    pub base_backoff_ms: u64,
    /// Ceiling for the retry delay
    pub max_backoff_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (PENBOX__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("server.request_timeout_seconds", 30)?
            .set_default("database.path", "data/penbox.db")?
            .set_default("instance.title", "Penbox")?
            .set_default("instance.description", "A personal publishing platform")?
            .set_default("federation.key_bits", DEFAULT_KEY_BITS as i64)?
            .set_default("federation.clock_skew_seconds", 300)?
            .set_default("federation.actor_cache_ttl_seconds", 86400)?
            .set_default("federation.collection_page_size", 20)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("federation.delivery.max_concurrency", 10)?
            .set_default("federation.delivery.timeout_seconds", 15)?
            .set_default("federation.delivery.max_attempts", 4)?
            .set_default("federation.delivery.base_backoff_ms", 1000)?
            .set_default("federation.delivery.max_backoff_ms", 60000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("PENBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.federation.key_bits < 1024 {
            return Err(AppError::Config(
                "federation.key_bits must be at least 1024".to_string(),
            ));
        }

        if self.federation.clock_skew_seconds <= 0 {
            return Err(AppError::Config(
                "federation.clock_skew_seconds must be greater than 0".to_string(),
            ));
        }

        if self.federation.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "federation.delivery.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.federation.delivery.max_concurrency == 0 {
            return Err(AppError::Config(
                "federation.delivery.max_concurrency must be at least 1".to_string(),
            ));
        }

        if self.actor.username.is_empty()
            || !self
                .actor
                .username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(AppError::Config(format!(
                "actor.username contains unsupported characters: {:?}",
                self.actor.username
            )));
        }

        if is_local_server_domain(&self.server.domain) {
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                tracing::warn!(
                    domain = %self.server.domain,
                    "Serving federation over plain http for local development"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
