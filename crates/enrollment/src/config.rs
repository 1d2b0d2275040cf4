//! Configuration for the Moodle integration, the outbound throttle and
//! background jobs, read from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{EnrollmentError, EnrollmentResult};
use crate::moodle::roles;

fn required(name: &str) -> EnrollmentResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(EnrollmentError::Config(format!("{name} must be set"))),
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> EnrollmentResult<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| EnrollmentError::Config(format!("{name} has an invalid value: {raw}"))),
        _ => Ok(default),
    }
}

fn string_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Moodle web service connection and account defaults
#[derive(Debug, Clone)]
pub struct MoodleConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub default_course_id: i64,
    pub student_role_id: i64,
    pub user_lang: String,
    pub user_timezone: String,
    pub user_city: String,
    pub user_country: String,
}

impl MoodleConfig {
    pub fn from_env() -> EnrollmentResult<Self> {
        let config = Self {
            base_url: required("MOODLE_URL")?,
            token: required("MOODLE_TOKEN")?,
            timeout: Duration::from_secs(parse_or("MOODLE_TIMEOUT", 30u64)?),
            default_course_id: parse_or("MOODLE_DEFAULT_COURSE_ID", 2i64)?,
            student_role_id: parse_or("MOODLE_STUDENT_ROLE_ID", roles::STUDENT)?,
            user_lang: string_or("MOODLE_USER_LANG", "es"),
            user_timezone: string_or("MOODLE_USER_TIMEZONE", "America/Guayaquil"),
            user_city: string_or("MOODLE_USER_CITY", "Loja"),
            user_country: string_or("MOODLE_USER_COUNTRY", "EC"),
        };

        if !roles::is_valid(config.student_role_id) {
            return Err(EnrollmentError::Config(format!(
                "MOODLE_STUDENT_ROLE_ID {} is not a Moodle role",
                config.student_role_id
            )));
        }

        Ok(config)
    }

    /// Configuration pointing at `base_url` with defaults for everything else.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            timeout: Duration::from_secs(30),
            default_course_id: 2,
            student_role_id: roles::STUDENT,
            user_lang: "es".to_string(),
            user_timezone: "America/Guayaquil".to_string(),
            user_city: "Loja".to_string(),
            user_country: "EC".to_string(),
        }
    }
}

/// Fixed-window throttle for outbound Moodle calls
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub decay_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 60,
            decay_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> EnrollmentResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            enabled: parse_or("MOODLE_RATE_LIMIT_ENABLED", defaults.enabled)?,
            max_attempts: parse_or("MOODLE_RATE_LIMIT_MAX_ATTEMPTS", defaults.max_attempts)?,
            decay_seconds: parse_or("MOODLE_RATE_LIMIT_DECAY_SECONDS", defaults.decay_seconds)?,
        })
    }
}

/// Retry and execution policy for background jobs
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `backoff[n - 1]`, clamped to the last entry.
    pub backoff: Vec<Duration>,
    pub job_timeout: Duration,
    pub concurrency: usize,
    pub batch_size: usize,
    /// Delay between user creation and the first enrollment attempt.
    pub enroll_delay: Duration,
    /// Running jobs older than this are considered abandoned by a dead worker.
    pub stuck_after: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
            ],
            job_timeout: Duration::from_secs(120),
            concurrency: 4,
            batch_size: 20,
            enroll_delay: Duration::from_secs(5),
            stuck_after: Duration::from_secs(30 * 60),
        }
    }
}

impl JobConfig {
    pub fn from_env() -> EnrollmentResult<Self> {
        let defaults = Self::default();
        let max_attempts: u32 = parse_or("JOB_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(EnrollmentError::Config(
                "JOB_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            max_attempts,
            backoff: defaults.backoff,
            job_timeout: Duration::from_secs(parse_or("JOB_TIMEOUT_SECONDS", 120u64)?),
            concurrency: parse_or("WORKER_CONCURRENCY", defaults.concurrency)?.max(1),
            batch_size: parse_or("JOB_BATCH_SIZE", defaults.batch_size)?.max(1),
            enroll_delay: defaults.enroll_delay,
            stuck_after: Duration::from_secs(60 * parse_or("JOB_STUCK_AFTER_MINUTES", 30u64)?),
        })
    }

    /// Backoff to wait after a failed `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.backoff.is_empty() {
            return Duration::ZERO;
        }
        let index = (attempt.saturating_sub(1) as usize).min(self.backoff.len() - 1);
        self.backoff[index]
    }
}
