//! Fixed-window throttle for outbound Moodle API calls
//!
//! `attempt` and `hit` are separate so callers can check, call, then record.
//! The gap between them means a burst can overshoot the ceiling slightly;
//! the remote API tolerates that and the limiter only has to keep the
//! steady-state rate in check.
//!
//! Counter keys: `moodle_rate_limit:{identifier}`. The window expiry is set on
//! the first hit and the key disappears (count back to 0) when it elapses.
//! A full counter found without an expiry gets one again in `attempt`.

use std::sync::Arc;
use std::time::Duration;

use coursebridge_shared::{KeyValueStore, StoreResult};

use crate::config::RateLimitConfig;

/// Identifier shared by every Moodle call unless a caller picks its own.
pub const GLOBAL_IDENTIFIER: &str = "global";

/// Reported by `remaining` when throttling is disabled.
pub const UNLIMITED: u32 = u32::MAX;

const KEY_PREFIX: &str = "moodle_rate_limit";

/// The window for an identifier is full.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Moodle API rate limit exceeded ({max_attempts} calls per window), retry after {retry_after_seconds}s")]
pub struct RateLimitExceeded {
    pub max_attempts: u32,
    pub retry_after_seconds: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn key(identifier: &str) -> String {
        format!("{KEY_PREFIX}:{identifier}")
    }

    async fn current_count(&self, key: &str) -> StoreResult<u32> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0))
    }

    /// Check whether another call fits in the current window. Does not count
    /// the call; pair with [`RateLimiter::hit`] once the call was made.
    ///
    /// Store failures let the call through.
    pub async fn attempt(&self, identifier: &str) -> Result<bool, RateLimitExceeded> {
        if !self.config.enabled {
            return Ok(true);
        }

        let key = Self::key(identifier);
        let attempts = match self.current_count(&key).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(identifier, error = %e, "Rate limit store unavailable - allowing call");
                return Ok(true);
            }
        };

        if attempts >= self.config.max_attempts {
            let retry_after_seconds = match self.store.ttl(&key).await {
                Ok(Some(ttl)) => ttl.as_secs().max(1),
                Ok(None) => {
                    // Counter lost its expiry between increment and expire.
                    self.reopen_window(identifier, &key).await;
                    self.config.decay_seconds
                }
                Err(_) => self.config.decay_seconds,
            };

            tracing::warn!(
                identifier,
                attempts,
                max_attempts = self.config.max_attempts,
                retry_after = retry_after_seconds,
                "Moodle API rate limit exceeded"
            );

            return Err(RateLimitExceeded {
                max_attempts: self.config.max_attempts,
                retry_after_seconds,
            });
        }

        Ok(true)
    }

    /// Count one call against the window, opening a new window on the first hit.
    pub async fn hit(&self, identifier: &str) {
        if !self.config.enabled {
            return;
        }

        let key = Self::key(identifier);
        let result = async {
            let attempts = self.store.increment(&key).await?;
            if attempts == 1 {
                self.store
                    .expire(&key, Duration::from_secs(self.config.decay_seconds))
                    .await?;
            }
            StoreResult::Ok(attempts)
        }
        .await;

        match result {
            Ok(attempts) => tracing::debug!(
                identifier,
                attempts,
                max_attempts = self.config.max_attempts,
                "Moodle API call tracked"
            ),
            Err(e) => tracing::warn!(identifier, error = %e, "Failed to record Moodle API call"),
        }
    }

    async fn reopen_window(&self, identifier: &str, key: &str) {
        let decay = Duration::from_secs(self.config.decay_seconds);
        match self.store.expire(key, decay).await {
            Ok(()) => tracing::warn!(identifier, "Rate limit window had no expiry, reapplied"),
            Err(e) => tracing::warn!(identifier, error = %e, "Failed to reapply rate limit expiry"),
        }
    }

    /// Calls left in the current window.
    pub async fn remaining(&self, identifier: &str) -> u32 {
        if !self.config.enabled {
            return UNLIMITED;
        }

        match self.current_count(&Self::key(identifier)).await {
            Ok(attempts) => self.config.max_attempts.saturating_sub(attempts),
            Err(e) => {
                tracing::warn!(identifier, error = %e, "Rate limit store unavailable");
                self.config.max_attempts
            }
        }
    }

    /// Clear the counter and its window.
    pub async fn reset(&self, identifier: &str) -> StoreResult<()> {
        self.store.delete(&Self::key(identifier)).await
    }
}
