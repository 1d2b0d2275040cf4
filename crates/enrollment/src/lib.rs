// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CourseBridge Enrollment Module
//!
//! Turns paid Medusa orders into Moodle accounts and course enrollments.
//!
//! ## Features
//!
//! - **Idempotency**: Each webhook is claimed exactly once, duplicate orders are rejected
//! - **Moodle Client**: Rate-limited REST client with a typed error taxonomy
//! - **Background Jobs**: Durable queue with bounded retries and backoff
//! - **Compensation**: Users created without a completed enrollment are recorded for review
//! - **Retry Sweep**: Scheduled re-enrollment of unresolved failures
//! - **Workflow Tracking**: Per-order state machine for observability

pub mod compensation;
pub mod config;
pub mod error;
pub mod failed_enrollment;
pub mod idempotency;
pub mod intake;
pub mod jobs;
pub mod moodle;
pub mod queue;
pub mod rate_limit;
pub mod workflow;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod testing;

// Compensation
pub use compensation::{
    CompensationCache, CompensationOutcome, CompensationService, CompensationState,
    CompensationStatus, DEFAULT_RETRY_WINDOW,
};

// Config
pub use config::{JobConfig, MoodleConfig, RateLimitConfig};

// Error
pub use error::{EnrollmentError, EnrollmentResult, ErrorKind};

// Failed enrollments
pub use failed_enrollment::{
    FailedEnrollment, FailedEnrollmentRepository, InMemoryFailedEnrollmentRepository,
    NewFailedEnrollment, PgFailedEnrollmentRepository,
};

// Idempotency
pub use idempotency::{
    IdempotencyDecision, IdempotencyService, Identity, IdentityStore, InMemoryIdentityStore,
    InMemoryWebhookLedger, NewWebhookRecord, PgIdentityStore, PgWebhookLedger, WebhookLedger,
    WebhookRecord,
};

// Intake
pub use intake::{
    derive_order_id, parse_order_paid, resolve_webhook_id, IntakeOutcome, IntakeService,
    LineItem, OrderIdStrategy, OrderPaid,
};

// Jobs
pub use jobs::{JobOutcome, JobRunner, RunSummary};

// Moodle
pub use moodle::{
    create_or_find_user, roles, MoodleApi, MoodleClient, MoodleError, MoodleResult, MoodleUser,
    NewMoodleUser, SiteInfo, REQUIRED_FUNCTIONS,
};

// Queue
pub use queue::{EnrollmentJob, InMemoryJobQueue, JobQueue, JobStatus, PgJobQueue, QueueCounts, QueuedJob};

// Rate limit
pub use rate_limit::{RateLimitExceeded, RateLimiter, GLOBAL_IDENTIFIER};

// Workflow
pub use workflow::{EnrollmentState, WorkflowRecord, WorkflowTracker};

use std::sync::Arc;
use std::time::Duration;

use coursebridge_shared::KeyValueStore;
use sqlx::PgPool;

/// Storage and remote collaborators the enrollment services are built from
pub struct EnrollmentParts {
    pub store: Arc<dyn KeyValueStore>,
    pub moodle: Arc<dyn MoodleApi>,
    pub ledger: Arc<dyn WebhookLedger>,
    pub identities: Arc<dyn IdentityStore>,
    pub failures: Arc<dyn FailedEnrollmentRepository>,
    pub queue: Arc<dyn JobQueue>,
    pub default_course_id: i64,
    pub student_role_id: i64,
    pub jobs: JobConfig,
}

/// Main enrollment service that wires all enrollment functionality together
pub struct EnrollmentService {
    pub moodle: Arc<dyn MoodleApi>,
    pub idempotency: Arc<IdempotencyService>,
    pub compensation: Arc<CompensationService>,
    pub queue: Arc<dyn JobQueue>,
    pub workflow: WorkflowTracker,
    pub intake: IntakeService,
    pub jobs: JobRunner,
}

impl EnrollmentService {
    /// Create the enrollment service from environment variables, backed by
    /// Postgres and the given key-value store
    pub fn from_env(pool: PgPool, store: Arc<dyn KeyValueStore>) -> EnrollmentResult<Self> {
        let moodle_config = MoodleConfig::from_env()?;
        let rate_limiter = RateLimiter::new(store.clone(), RateLimitConfig::from_env()?);
        let default_course_id = moodle_config.default_course_id;
        let student_role_id = moodle_config.student_role_id;
        let client = MoodleClient::new(moodle_config, rate_limiter)?;

        Ok(Self::new(EnrollmentParts {
            store,
            moodle: Arc::new(client),
            ledger: Arc::new(PgWebhookLedger::new(pool.clone())),
            identities: Arc::new(PgIdentityStore::new(pool.clone())),
            failures: Arc::new(PgFailedEnrollmentRepository::new(pool.clone())),
            queue: Arc::new(PgJobQueue::new(pool)),
            default_course_id,
            student_role_id,
            jobs: JobConfig::from_env()?,
        }))
    }

    /// Create the enrollment service from explicit parts
    pub fn new(parts: EnrollmentParts) -> Self {
        let workflow = WorkflowTracker::new(parts.store.clone());
        let idempotency = Arc::new(IdempotencyService::new(
            parts.ledger,
            parts.identities.clone(),
        ));
        let compensation = Arc::new(CompensationService::new(
            parts.store,
            parts.failures,
            parts.moodle.clone(),
            parts.default_course_id,
            parts.student_role_id,
        ));

        Self {
            intake: IntakeService::new(idempotency.clone(), parts.queue.clone(), workflow.clone()),
            jobs: JobRunner::new(
                parts.queue.clone(),
                parts.moodle.clone(),
                parts.identities,
                compensation.clone(),
                workflow.clone(),
                parts.jobs,
                parts.default_course_id,
                parts.student_role_id,
            ),
            moodle: parts.moodle,
            idempotency,
            compensation,
            queue: parts.queue,
            workflow,
        }
    }

    /// Run the retry sweep over failures created within the last `days` days
    pub async fn retry_failed_enrollments(&self, days: u64) -> EnrollmentResult<usize> {
        self.compensation
            .retry_failed_enrollments(Duration::from_secs(days * 24 * 60 * 60))
            .await
    }
}
