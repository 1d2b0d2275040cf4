//! Background job execution
//!
//! `CreateMoodleUser` resolves the Moodle account, records the identity and
//! publishes an `EnrollUser` job. `EnrollUser` enrolls the account in every
//! course of the order. Each attempt runs under a hard timeout; failures are
//! re-queued on the backoff schedule until the attempt budget is spent, then
//! the job's failure hook runs.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::compensation::CompensationService;
use crate::config::JobConfig;
use crate::error::{EnrollmentError, EnrollmentResult};
use crate::idempotency::IdentityStore;
use crate::intake::OrderPaid;
use crate::moodle::{create_or_find_user, MoodleApi, MoodleUser};
use crate::queue::{EnrollmentJob, JobQueue, QueuedJob};
use crate::workflow::{EnrollmentState, WorkflowTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub claimed: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
}

pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    moodle: Arc<dyn MoodleApi>,
    identities: Arc<dyn IdentityStore>,
    compensation: Arc<CompensationService>,
    workflow: WorkflowTracker,
    config: JobConfig,
    default_course_id: i64,
    student_role_id: i64,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        moodle: Arc<dyn MoodleApi>,
        identities: Arc<dyn IdentityStore>,
        compensation: Arc<CompensationService>,
        workflow: WorkflowTracker,
        config: JobConfig,
        default_course_id: i64,
        student_role_id: i64,
    ) -> Self {
        Self {
            queue,
            moodle,
            identities,
            compensation,
            workflow,
            config,
            default_course_id,
            student_role_id,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Claim one batch of due jobs and run them with bounded parallelism.
    pub async fn run_due(&self) -> EnrollmentResult<RunSummary> {
        let jobs = self.queue.claim_due(self.config.batch_size).await?;
        let mut summary = RunSummary {
            claimed: jobs.len(),
            ..RunSummary::default()
        };
        if jobs.is_empty() {
            return Ok(summary);
        }

        let outcomes: Vec<JobOutcome> = stream::iter(jobs)
            .map(|job| self.run_job(job))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                JobOutcome::Completed => summary.completed += 1,
                JobOutcome::Retrying => summary.retrying += 1,
                JobOutcome::Failed => summary.failed += 1,
            }
        }

        tracing::info!(
            claimed = summary.claimed,
            completed = summary.completed,
            retrying = summary.retrying,
            failed = summary.failed,
            "Job batch finished"
        );
        Ok(summary)
    }

    /// Re-queue jobs abandoned by a crashed worker.
    pub async fn recover_stuck(&self) -> EnrollmentResult<u64> {
        let recovered = self.queue.recover_stuck(self.config.stuck_after).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Recovered stuck jobs");
        }
        Ok(recovered)
    }

    pub async fn run_job(&self, job: QueuedJob) -> JobOutcome {
        let order_id = job.order_id().to_string();
        let kind = job.job.kind();

        // A recovered job may already have spent its budget.
        if job.attempts > self.config.max_attempts {
            let error = EnrollmentError::AttemptsExhausted(self.config.max_attempts);
            self.finalize_failure(&job, &error).await;
            return JobOutcome::Failed;
        }

        tracing::info!(
            job_id = %job.id,
            job = kind,
            order_id = %order_id,
            attempt = job.attempts,
            "Running job"
        );

        let result = match tokio::time::timeout(self.config.job_timeout, self.execute(&job.job)).await {
            Ok(result) => result,
            Err(_) => Err(EnrollmentError::Timeout(self.config.job_timeout.as_secs())),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.queue.complete(job.id).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                }
                JobOutcome::Completed
            }
            Err(error) if job.attempts < self.config.max_attempts => {
                let delay = self.config.backoff_for(job.attempts);
                tracing::warn!(
                    job_id = %job.id,
                    job = kind,
                    order_id = %order_id,
                    attempt = job.attempts,
                    max_attempts = self.config.max_attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %error,
                    error_kind = %error.kind(),
                    "Job failed, will retry"
                );
                if let Err(e) = self.queue.retry_later(job.id, delay, &error.to_string()).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to re-queue job");
                }
                JobOutcome::Retrying
            }
            Err(error) => {
                self.finalize_failure(&job, &error).await;
                JobOutcome::Failed
            }
        }
    }

    async fn finalize_failure(&self, job: &QueuedJob, error: &EnrollmentError) {
        tracing::error!(
            job_id = %job.id,
            job = job.job.kind(),
            order_id = %job.order_id(),
            attempts = job.attempts,
            error = %error,
            error_kind = %error.kind(),
            "Job failed permanently"
        );

        if let Err(e) = self.queue.fail_permanently(job.id, &error.to_string()).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to mark job failed");
        }

        self.on_permanent_failure(&job.job, error).await;
    }

    async fn on_permanent_failure(&self, job: &EnrollmentJob, error: &EnrollmentError) {
        match job {
            EnrollmentJob::EnrollUser { user, order } => {
                let reason = error.to_string();
                self.transition(&order.order_id, EnrollmentState::EnrollmentFailed, Some(&reason))
                    .await;
                if let Err(e) = self
                    .compensation
                    .compensate_failed_enrollment_for_user(&order.order_id, user.id, &reason)
                    .await
                {
                    tracing::error!(
                        order_id = %order.order_id,
                        moodle_user_id = user.id,
                        error = %e,
                        "Failed to record failed enrollment"
                    );
                }
            }
            EnrollmentJob::CreateMoodleUser { order } => {
                tracing::error!(
                    order_id = %order.order_id,
                    webhook_id = %order.webhook_id,
                    email = %order.customer_email,
                    error = %error,
                    "Moodle user could not be created; order needs operator attention"
                );
            }
        }
    }

    async fn execute(&self, job: &EnrollmentJob) -> EnrollmentResult<()> {
        match job {
            EnrollmentJob::CreateMoodleUser { order } => self.create_moodle_user(order).await,
            EnrollmentJob::EnrollUser { user, order } => self.enroll_user(user, order).await,
        }
    }

    async fn create_moodle_user(&self, order: &OrderPaid) -> EnrollmentResult<()> {
        self.transition(&order.order_id, EnrollmentState::UserCreating, None)
            .await;

        let user = create_or_find_user(
            self.moodle.as_ref(),
            &order.customer_email,
            &order.customer_first_name,
            &order.customer_last_name,
        )
        .await?;

        tracing::info!(
            order_id = %order.order_id,
            moodle_user_id = user.id,
            existing = user.existing,
            "Moodle user ready"
        );
        self.transition(&order.order_id, EnrollmentState::UserCreated, None)
            .await;

        self.publish_user_ready(user, order).await
    }

    /// Record the identity and queue enrollment for a resolved account.
    async fn publish_user_ready(&self, user: MoodleUser, order: &OrderPaid) -> EnrollmentResult<()> {
        self.identities
            .upsert(&order.customer_email, &order.full_name(), user.id, &order.order_id)
            .await?;

        let moodle_user_id = user.id;
        let job = EnrollmentJob::EnrollUser {
            user,
            order: order.clone(),
        };
        let job_id = self.queue.enqueue(&job, self.config.enroll_delay).await?;

        tracing::info!(
            order_id = %order.order_id,
            moodle_user_id,
            job_id = %job_id,
            delay_secs = self.config.enroll_delay.as_secs(),
            "Enrollment job queued"
        );
        Ok(())
    }

    async fn enroll_user(&self, user: &MoodleUser, order: &OrderPaid) -> EnrollmentResult<()> {
        self.transition(&order.order_id, EnrollmentState::Enrolling, None)
            .await;

        let course_ids = order.course_ids(self.default_course_id);
        self.compensation
            .record_user_creation(user.id, &order.order_id)
            .await;

        for course_id in &course_ids {
            let course_id = *course_id;
            match self.moodle.is_user_enrolled(user.id, course_id).await {
                Ok(true) => {
                    tracing::info!(
                        order_id = %order.order_id,
                        moodle_user_id = user.id,
                        course_id,
                        "User already enrolled, skipping"
                    );
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        order_id = %order.order_id,
                        moodle_user_id = user.id,
                        course_id,
                        error = %e,
                        "Could not check enrollment, attempting anyway"
                    );
                }
            }

            self.moodle
                .enroll_user(user.id, course_id, self.student_role_id)
                .await
                .inspect_err(|e| {
                    tracing::warn!(
                        order_id = %order.order_id,
                        moodle_user_id = user.id,
                        course_id,
                        error = %e,
                        "Course enrollment failed"
                    );
                })?;
        }

        self.compensation
            .mark_enrollment_success(&order.order_id)
            .await;
        self.transition(&order.order_id, EnrollmentState::Enrolled, None)
            .await;

        tracing::info!(
            order_id = %order.order_id,
            moodle_user_id = user.id,
            courses = ?course_ids,
            "Enrollment completed"
        );
        Ok(())
    }

    async fn transition(&self, order_id: &str, state: EnrollmentState, detail: Option<&str>) {
        if let Err(e) = self.workflow.advance(order_id, state, detail).await {
            tracing::warn!(order_id, state = %state, error = %e, "Workflow state not updated");
        }
    }
}
