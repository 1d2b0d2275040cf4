//! Moodle web service client
//!
//! Stateless wrapper around Moodle's REST endpoint
//! (`/webservice/rest/server.php`). Every call passes through the
//! [`RateLimiter`] and every failure is normalised into [`MoodleError`].

use std::time::Instant;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::MoodleConfig;
use crate::error::ErrorKind;
use crate::rate_limit::{RateLimitExceeded, RateLimiter, GLOBAL_IDENTIFIER};

/// Standard Moodle role ids.
pub mod roles {
    pub const MANAGER: i64 = 1;
    pub const COURSE_CREATOR: i64 = 2;
    pub const TEACHER: i64 = 3;
    pub const NON_EDITING_TEACHER: i64 = 4;
    pub const STUDENT: i64 = 5;
    pub const GUEST: i64 = 6;
    pub const AUTHENTICATED_USER: i64 = 7;
    pub const AUTHENTICATED_USER_ON_FRONTPAGE: i64 = 8;

    pub fn is_valid(role_id: i64) -> bool {
        (MANAGER..=AUTHENTICATED_USER_ON_FRONTPAGE).contains(&role_id)
    }

    pub fn name(role_id: i64) -> &'static str {
        match role_id {
            MANAGER => "Manager",
            COURSE_CREATOR => "Course Creator",
            TEACHER => "Teacher",
            NON_EDITING_TEACHER => "Non-editing Teacher",
            STUDENT => "Student",
            GUEST => "Guest",
            AUTHENTICATED_USER => "Authenticated User",
            AUTHENTICATED_USER_ON_FRONTPAGE => "Authenticated User on Site Frontpage",
            _ => "Unknown Role",
        }
    }
}

/// Moodle error codes that mean the token cannot perform the call.
const AUTHORIZATION_ERROR_CODES: &[&str] = &[
    "invalidtoken",
    "accessexception",
    "nopermissions",
    "servicenotavailable",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoodleError {
    #[error("Failed to connect to Moodle: {reason}")]
    Connection { reason: String },

    #[error("Moodle rejected the token: {reason}")]
    Authorization { reason: String },

    #[error("Moodle rejected {function} [{code}]: {message}")]
    RemoteValidation {
        function: String,
        code: String,
        message: String,
    },

    #[error("Moodle API rate limit exceeded ({max_attempts} calls per window), retry after {retry_after_seconds}s")]
    RateLimitExceeded {
        max_attempts: u32,
        retry_after_seconds: u64,
    },

    #[error("Unexpected response from {function}: {reason}")]
    InvalidResponse { function: String, reason: String },

    #[error("Invalid role id {0}")]
    InvalidRole(i64),
}

impl MoodleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MoodleError::Connection { .. } | MoodleError::InvalidResponse { .. } => {
                ErrorKind::Transient
            }
            MoodleError::Authorization { .. }
            | MoodleError::RemoteValidation { .. }
            | MoodleError::InvalidRole(_) => ErrorKind::Permanent,
            MoodleError::RateLimitExceeded { .. } => ErrorKind::RateLimited,
        }
    }
}

impl From<RateLimitExceeded> for MoodleError {
    fn from(e: RateLimitExceeded) -> Self {
        MoodleError::RateLimitExceeded {
            max_attempts: e.max_attempts,
            retry_after_seconds: e.retry_after_seconds,
        }
    }
}

pub type MoodleResult<T> = Result<T, MoodleError>;

/// A Moodle account as seen by the enrollment workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoodleUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    /// Found by email rather than created by this workflow.
    #[serde(default)]
    pub existing: bool,
}

/// Fields needed to create a Moodle account
#[derive(Debug, Clone)]
pub struct NewMoodleUser {
    pub username: String,
    pub password: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SiteFunction {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Subset of `core_webservice_get_site_info` used for connectivity checks
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SiteInfo {
    #[serde(default)]
    pub sitename: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub userid: i64,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub functions: Vec<SiteFunction>,
}

impl SiteInfo {
    pub fn can_call(&self, function: &str) -> bool {
        self.functions.iter().any(|f| f.name == function)
    }
}

/// Web service functions the enrollment workflow depends on.
pub const REQUIRED_FUNCTIONS: &[&str] = &[
    "core_user_get_users_by_field",
    "core_user_create_users",
    "enrol_manual_enrol_users",
    "core_enrol_get_users_courses",
];

#[async_trait]
pub trait MoodleApi: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> MoodleResult<Option<MoodleUser>>;

    async fn create_user(&self, user: &NewMoodleUser) -> MoodleResult<MoodleUser>;

    async fn enroll_user(&self, user_id: i64, course_id: i64, role_id: i64) -> MoodleResult<()>;

    async fn is_user_enrolled(&self, user_id: i64, course_id: i64) -> MoodleResult<bool>;

    async fn get_site_info(&self) -> MoodleResult<SiteInfo>;
}

/// Find the account for `email`, creating it with generated credentials when
/// none exists. Existing accounts come back flagged `existing = true`.
pub async fn create_or_find_user(
    api: &dyn MoodleApi,
    email: &str,
    firstname: &str,
    lastname: &str,
) -> MoodleResult<MoodleUser> {
    if let Some(mut user) = api.find_user_by_email(email).await? {
        tracing::info!(email, moodle_user_id = user.id, "Moodle user already exists");
        user.existing = true;
        return Ok(user);
    }

    let new_user = NewMoodleUser {
        username: generate_username(email),
        password: generate_password(12),
        firstname: firstname.to_string(),
        lastname: lastname.to_string(),
        email: email.to_string(),
    };

    let user = api.create_user(&new_user).await?;
    tracing::info!(email, moodle_user_id = user.id, "Moodle user created");
    Ok(user)
}

/// Username from the email local part plus a 10-character unique suffix.
pub fn generate_username(email: &str) -> String {
    let local = email.split('@').next().unwrap_or_default();
    let mut base: String = local
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();

    if base.len() < 4 {
        let digest = Sha256::digest(email.as_bytes());
        base = hex::encode(digest)[..8].to_string();
    }

    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}", base, &suffix[suffix.len() - 10..])
}

/// Random password with at least one lowercase, uppercase, digit and symbol.
pub fn generate_password(length: usize) -> String {
    const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const DIGITS: &[u8] = b"0123456789";
    const SPECIAL: &[u8] = b"!@#$%";

    let mut rng = rand::rng();
    let mut pick = |set: &[u8]| set[rng.random_range(0..set.len())] as char;

    let mut chars = vec![
        pick(LOWERCASE),
        pick(UPPERCASE),
        pick(DIGITS),
        pick(SPECIAL),
    ];

    let all: Vec<u8> = [LOWERCASE, UPPERCASE, DIGITS, SPECIAL].concat();
    while chars.len() < length {
        chars.push(pick(&all));
    }

    chars.shuffle(&mut rand::rng());
    chars.into_iter().collect()
}

/// HTTP client for the Moodle REST web service
#[derive(Clone)]
pub struct MoodleClient {
    http: reqwest::Client,
    config: MoodleConfig,
    rate_limiter: RateLimiter,
}

impl MoodleClient {
    pub fn new(config: MoodleConfig, rate_limiter: RateLimiter) -> MoodleResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("coursebridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MoodleError::Connection {
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        tracing::info!(
            url = %config.base_url,
            timeout_secs = config.timeout.as_secs(),
            rate_limit_enabled = rate_limiter.config().enabled,
            "Moodle client initialized"
        );

        Ok(Self {
            http,
            config,
            rate_limiter,
        })
    }

    pub fn config(&self) -> &MoodleConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/webservice/rest/server.php",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Invoke a web service function and return its decoded JSON result.
    async fn call(&self, function: &str, params: Vec<(String, String)>) -> MoodleResult<Value> {
        self.rate_limiter.attempt(GLOBAL_IDENTIFIER).await?;

        let mut form: Vec<(String, String)> = vec![
            ("wstoken".to_string(), self.config.token.clone()),
            ("wsfunction".to_string(), function.to_string()),
            ("moodlewsrestformat".to_string(), "json".to_string()),
        ];
        form.extend(params);

        let started = Instant::now();
        let sent = self.http.post(self.endpoint()).form(&form).send().await;
        self.rate_limiter.hit(GLOBAL_IDENTIFIER).await;

        let response = sent.map_err(|e| {
            let reason = if e.is_timeout() {
                format!("request timed out after {}s", self.config.timeout.as_secs())
            } else {
                e.to_string()
            };
            tracing::error!(function, error = %reason, "Connection error to Moodle");
            MoodleError::Connection { reason }
        })?;

        let status = response.status();
        let remaining = self.rate_limiter.remaining(GLOBAL_IDENTIFIER).await;
        tracing::info!(
            function,
            status = status.as_u16(),
            time_ms = started.elapsed().as_millis() as u64,
            rate_limit_remaining = remaining,
            "Moodle API call"
        );

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(match status.as_u16() {
                401 => MoodleError::Authorization {
                    reason: "Unauthorized - invalid Moodle token".to_string(),
                },
                403 => MoodleError::Authorization {
                    reason: "Forbidden - insufficient permissions".to_string(),
                },
                429 => MoodleError::RateLimitExceeded {
                    max_attempts: self.rate_limiter.config().max_attempts,
                    retry_after_seconds: retry_after
                        .unwrap_or(self.rate_limiter.config().decay_seconds),
                },
                500 | 502 | 503 => MoodleError::Connection {
                    reason: format!("Moodle server error (HTTP {})", status.as_u16()),
                },
                code => MoodleError::Connection {
                    reason: format!("HTTP error {code}"),
                },
            });
        }

        let body = response.text().await.map_err(|e| MoodleError::Connection {
            reason: format!("Failed to read response body: {e}"),
        })?;

        parse_response(function, &body)
    }
}

/// Decode a Moodle response body, turning `{"exception": ...}` payloads into errors.
fn parse_response(function: &str, body: &str) -> MoodleResult<Value> {
    let body = body.trim_matches(|c: char| c.is_control() || c.is_whitespace());
    if body.is_empty() || body == "null" {
        return Ok(Value::Null);
    }

    let data: Value = serde_json::from_str(body).map_err(|e| MoodleError::InvalidResponse {
        function: function.to_string(),
        reason: format!("invalid JSON: {e}"),
    })?;

    if data.get("exception").is_some() {
        let code = data
            .get("errorcode")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Moodle error")
            .to_string();

        tracing::error!(function, error_code = %code, message = %message, "Moodle API error");

        if AUTHORIZATION_ERROR_CODES.contains(&code.as_str()) {
            return Err(MoodleError::Authorization {
                reason: format!("[{code}] {message}"),
            });
        }
        return Err(MoodleError::RemoteValidation {
            function: function.to_string(),
            code,
            message,
        });
    }

    Ok(data)
}

#[async_trait]
impl MoodleApi for MoodleClient {
    async fn find_user_by_email(&self, email: &str) -> MoodleResult<Option<MoodleUser>> {
        let response = self
            .call(
                "core_user_get_users_by_field",
                vec![
                    ("field".to_string(), "email".to_string()),
                    ("values[0]".to_string(), email.to_string()),
                ],
            )
            .await?;

        let users: Vec<MoodleUser> = match response {
            Value::Null => Vec::new(),
            other => {
                serde_json::from_value(other).map_err(|e| MoodleError::InvalidResponse {
                    function: "core_user_get_users_by_field".to_string(),
                    reason: e.to_string(),
                })?
            }
        };

        Ok(users.into_iter().next())
    }

    async fn create_user(&self, user: &NewMoodleUser) -> MoodleResult<MoodleUser> {
        let fields = [
            ("username", user.username.as_str()),
            ("password", user.password.as_str()),
            ("firstname", user.firstname.as_str()),
            ("lastname", user.lastname.as_str()),
            ("email", user.email.as_str()),
            ("auth", "manual"),
            ("lang", self.config.user_lang.as_str()),
            ("timezone", self.config.user_timezone.as_str()),
            ("mailformat", "1"),
            ("maildisplay", "2"),
            ("city", self.config.user_city.as_str()),
            ("country", self.config.user_country.as_str()),
        ];
        let params = fields
            .iter()
            .map(|(name, value)| (format!("users[0][{name}]"), value.to_string()))
            .collect();

        let response = self.call("core_user_create_users", params).await?;

        let id = response
            .get(0)
            .and_then(|u| u.get("id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| MoodleError::InvalidResponse {
                function: "core_user_create_users".to_string(),
                reason: format!("missing user id in response for {}", user.email),
            })?;

        Ok(MoodleUser {
            id,
            username: user.username.clone(),
            email: user.email.clone(),
            firstname: user.firstname.clone(),
            lastname: user.lastname.clone(),
            existing: false,
        })
    }

    async fn enroll_user(&self, user_id: i64, course_id: i64, role_id: i64) -> MoodleResult<()> {
        if !roles::is_valid(role_id) {
            return Err(MoodleError::InvalidRole(role_id));
        }

        self.call(
            "enrol_manual_enrol_users",
            vec![
                ("enrolments[0][roleid]".to_string(), role_id.to_string()),
                ("enrolments[0][userid]".to_string(), user_id.to_string()),
                ("enrolments[0][courseid]".to_string(), course_id.to_string()),
            ],
        )
        .await?;

        tracing::info!(
            moodle_user_id = user_id,
            course_id,
            role = roles::name(role_id),
            "User enrolled in Moodle course"
        );
        Ok(())
    }

    async fn is_user_enrolled(&self, user_id: i64, course_id: i64) -> MoodleResult<bool> {
        let response = self
            .call(
                "core_enrol_get_users_courses",
                vec![("userid".to_string(), user_id.to_string())],
            )
            .await?;

        Ok(response
            .as_array()
            .map(|courses| {
                courses
                    .iter()
                    .any(|c| c.get("id").and_then(Value::as_i64) == Some(course_id))
            })
            .unwrap_or(false))
    }

    async fn get_site_info(&self) -> MoodleResult<SiteInfo> {
        let response = self.call("core_webservice_get_site_info", vec![]).await?;
        let info: SiteInfo =
            serde_json::from_value(response).map_err(|e| MoodleError::InvalidResponse {
                function: "core_webservice_get_site_info".to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            sitename = %info.sitename,
            username = %info.username,
            "Moodle token valid"
        );
        Ok(info)
    }
}
