//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub instance: InstanceConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com"), may carry a port
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
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

/// Federation tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Lifetime of an outgoing signature and maximum accepted age of an incoming one
    pub signature_expiry_seconds: u64,
    /// Tolerated clock drift for `Date` headers dated in the future
    pub clock_skew_seconds: u64,
    /// Remote actors older than this are re-fetched before use (default: 24h)
    pub actor_ttl_seconds: u64,
    /// Maximum number of inbox POSTs in flight per delivery
    pub delivery_concurrency: usize,
    /// Timeout applied to every outbound HTTP request
    pub http_timeout_seconds: u64,
    /// Deadline for processing one inbound request end to end
    pub inbound_deadline_seconds: u64,
    /// Scheme used for WebFinger lookups ("https" in production)
    pub webfinger_scheme: String,
    /// Allow fetching from loopback/private addresses (development and tests only)
    pub allow_private_hosts: bool,
    /// User-Agent sent on outbound requests
    pub user_agent: String,
}

impl FederationConfig {
    pub fn signature_expiry(&self) -> Duration {
        Duration::from_secs(self.signature_expiry_seconds)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_seconds)
    }

    pub fn actor_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_ttl_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn inbound_deadline(&self) -> Duration {
        Duration::from_secs(self.inbound_deadline_seconds)
    }
}

/// Instance actor used to sign server-originated fetches
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Username of the instance actor (default: "instance")
    #[serde(default = "default_instance_actor_username")]
    pub actor_username: String,
    /// Display name of the instance actor
    #[serde(default = "default_instance_display_name")]
    pub display_name: String,
}

fn default_instance_actor_username() -> String {
    "instance".to_string()
}

fn default_instance_display_name() -> String {
    "Lightpub".to_string()
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
    /// 4. Environment variables (LIGHTPUB__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "https")?
            .set_default("database.path", "data/lightpub.db")?
            .set_default("federation.signature_expiry_seconds", 3600)?
            .set_default("federation.clock_skew_seconds", 300)?
            .set_default("federation.actor_ttl_seconds", 86400)?
            .set_default("federation.delivery_concurrency", 10)?
            .set_default("federation.http_timeout_seconds", 30)?
            .set_default("federation.inbound_deadline_seconds", 30)?
            .set_default("federation.webfinger_scheme", "https")?
            .set_default("federation.allow_private_hosts", false)?
            .set_default(
                "federation.user_agent",
                format!("Lightpub/{}", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("instance.actor_username", "instance")?
            .set_default("instance.display_name", "Lightpub")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("LIGHTPUB")
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

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.server.domain.trim().is_empty() {
            return Err(AppError::Config("server.domain must be set".to_string()));
        }

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(AppError::Config(
                "server.protocol must be http or https".to_string(),
            ));
        }

        if !matches!(self.federation.webfinger_scheme.as_str(), "http" | "https") {
            return Err(AppError::Config(
                "federation.webfinger_scheme must be http or https".to_string(),
            ));
        }

        let durations = [
            (
                "federation.signature_expiry_seconds",
                self.federation.signature_expiry_seconds,
            ),
            (
                "federation.actor_ttl_seconds",
                self.federation.actor_ttl_seconds,
            ),
            (
                "federation.http_timeout_seconds",
                self.federation.http_timeout_seconds,
            ),
            (
                "federation.inbound_deadline_seconds",
                self.federation.inbound_deadline_seconds,
            ),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(AppError::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.federation.delivery_concurrency == 0 {
            return Err(AppError::Config(
                "federation.delivery_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.federation.allow_private_hosts {
            tracing::warn!("Fetching from private and loopback hosts is allowed");
        }

        Ok(())
    }
}
