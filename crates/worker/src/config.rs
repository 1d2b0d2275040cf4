//! Worker configuration

/// Top of every hour.
pub const DEFAULT_RETRY_SWEEP_CRON: &str = "0 0 * * * *";
pub const DEFAULT_RETRY_SWEEP_DAYS: u64 = 7;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub retry_sweep_cron: String,
    pub retry_sweep_days: u64,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let retry_sweep_days = match std::env::var("RETRY_SWEEP_DAYS") {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(days) if days > 0 => days,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "RETRY_SWEEP_DAYS",
                        reason: format!("expected a positive number of days, got {raw:?}"),
                    })
                }
            },
            Err(_) => DEFAULT_RETRY_SWEEP_DAYS,
        };

        Ok(Self {
            database_url,
            redis_url: std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            retry_sweep_cron: std::env::var("RETRY_SWEEP_CRON")
                .ok()
                .filter(|cron| !cron.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_RETRY_SWEEP_CRON.to_string()),
            retry_sweep_days,
        })
    }
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[set]"))
            .field("retry_sweep_cron", &self.retry_sweep_cron)
            .field("retry_sweep_days", &self.retry_sweep_days)
            .finish()
    }
}
