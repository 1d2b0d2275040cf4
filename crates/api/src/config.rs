//! API server configuration

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub webhook_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address = std::env::var("BIND_ADDRESS")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                name: "BIND_ADDRESS",
                reason: e.to_string(),
            })?;

        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let redis_url = std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty());

        let webhook_secret = std::env::var("MEDUSA_WEBHOOK_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty())
            .ok_or(ConfigError::Missing("MEDUSA_WEBHOOK_SECRET"))?;

        Ok(Self {
            bind_address,
            database_url,
            redis_url,
            webhook_secret,
        })
    }
}

// Keep the secret out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[set]"))
            .field("webhook_secret", &"[redacted]")
            .finish()
    }
}
