//! Compensation for the two-phase create-user/enroll workflow
//!
//! Working state per order lives in the key-value store under
//! `compensation:user:{order_id}` and expires on its own. When enrollment
//! fails after the Moodle user exists, a durable [`FailedEnrollment`] row is
//! written for the retry sweep and for manual review.
//!
//! [`FailedEnrollment`]: crate::failed_enrollment::FailedEnrollment

use std::sync::Arc;
use std::time::Duration;

use coursebridge_shared::{KeyValueStore, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EnrollmentResult;
use crate::failed_enrollment::{FailedEnrollmentRepository, NewFailedEnrollment};
use crate::moodle::MoodleApi;
use crate::workflow::{EnrollmentState, WorkflowTracker};

pub const PENDING_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const COMPLETED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const FAILED_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default look-back for the retry sweep.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const KEY_PREFIX: &str = "compensation:user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    PendingEnrollment,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationState {
    pub moodle_user_id: i64,
    pub status: CompensationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub failed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl CompensationState {
    pub fn pending(moodle_user_id: i64) -> Self {
        Self {
            moodle_user_id,
            status: CompensationStatus::PendingEnrollment,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
            failed_at: None,
            failure_reason: None,
        }
    }
}

/// JSON view over the key-value store
#[derive(Clone)]
pub struct CompensationCache {
    store: Arc<dyn KeyValueStore>,
}

impl CompensationCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(order_id: &str) -> String {
        format!("{KEY_PREFIX}:{order_id}")
    }

    pub async fn get(&self, order_id: &str) -> StoreResult<Option<CompensationState>> {
        match self.store.get(&Self::key(order_id)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::InvalidValue(format!("compensation state for {order_id}: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn put(&self, order_id: &str, state: &CompensationState, ttl: Duration) -> StoreResult<()> {
        let raw = serde_json::to_string(state)
            .map_err(|e| StoreError::InvalidValue(e.to_string()))?;
        self.store.set(&Self::key(order_id), &raw, Some(ttl)).await
    }
}

/// Result of reporting a failed enrollment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// A new durable record was written.
    Recorded(Uuid),
    /// An unresolved record already exists for the order.
    AlreadyRecorded,
    /// No cached state and no user id to fall back on.
    NoState,
    /// The order already completed; nothing to compensate.
    AlreadyCompleted,
}

pub struct CompensationService {
    cache: CompensationCache,
    workflow: WorkflowTracker,
    failures: Arc<dyn FailedEnrollmentRepository>,
    moodle: Arc<dyn MoodleApi>,
    default_course_id: i64,
    student_role_id: i64,
}

impl CompensationService {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        failures: Arc<dyn FailedEnrollmentRepository>,
        moodle: Arc<dyn MoodleApi>,
        default_course_id: i64,
        student_role_id: i64,
    ) -> Self {
        Self {
            cache: CompensationCache::new(store.clone()),
            workflow: WorkflowTracker::new(store),
            failures,
            moodle,
            default_course_id,
            student_role_id,
        }
    }

    pub fn failures(&self) -> &Arc<dyn FailedEnrollmentRepository> {
        &self.failures
    }

    /// Cached state for an order. Unreadable entries count as absent.
    pub async fn state(&self, order_id: &str) -> Option<CompensationState> {
        match self.cache.get(order_id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(order_id, error = %e, "Failed to read compensation state");
                None
            }
        }
    }

    async fn store_state(&self, order_id: &str, state: &CompensationState, ttl: Duration) {
        if let Err(e) = self.cache.put(order_id, state, ttl).await {
            tracing::warn!(order_id, error = %e, "Failed to write compensation state");
        }
    }

    /// Start (or restart) tracking an order as pending enrollment.
    pub async fn record_user_creation(&self, moodle_user_id: i64, order_id: &str) {
        let mut state = CompensationState::pending(moodle_user_id);
        if let Some(existing) = self.state(order_id).await {
            state.created_at = existing.created_at;
        }

        self.store_state(order_id, &state, PENDING_TTL).await;
        tracing::info!(moodle_user_id, order_id, "User creation recorded for compensation");
    }

    pub async fn mark_enrollment_success(&self, order_id: &str) {
        let Some(mut state) = self.state(order_id).await else {
            tracing::warn!(order_id, "No compensation state found when marking enrollment success");
            return;
        };

        state.status = CompensationStatus::Completed;
        state.completed_at = Some(OffsetDateTime::now_utc());
        self.store_state(order_id, &state, COMPLETED_TTL).await;

        tracing::info!(
            order_id,
            moodle_user_id = state.moodle_user_id,
            "Enrollment marked as successful"
        );
    }

    /// Report a failure using only the cached state. Without it there is no
    /// user id to record, so the call is a logged no-op.
    pub async fn compensate_failed_enrollment(
        &self,
        order_id: &str,
        reason: &str,
    ) -> EnrollmentResult<CompensationOutcome> {
        let Some(state) = self.state(order_id).await else {
            tracing::warn!(order_id, reason, "No compensation state found for failed enrollment");
            return Ok(CompensationOutcome::NoState);
        };

        self.record_failure(order_id, state, reason).await
    }

    /// Report a failure for a known Moodle user. Falls back to a synthesized
    /// state when the cache entry is gone, so the durable record is always written.
    pub async fn compensate_failed_enrollment_for_user(
        &self,
        order_id: &str,
        moodle_user_id: i64,
        reason: &str,
    ) -> EnrollmentResult<CompensationOutcome> {
        let state = match self.state(order_id).await {
            Some(state) if state.moodle_user_id == moodle_user_id => state,
            _ => {
                tracing::warn!(
                    order_id,
                    moodle_user_id,
                    "Compensation state missing, recording failure from job context"
                );
                CompensationState::pending(moodle_user_id)
            }
        };

        self.record_failure(order_id, state, reason).await
    }

    async fn record_failure(
        &self,
        order_id: &str,
        mut state: CompensationState,
        reason: &str,
    ) -> EnrollmentResult<CompensationOutcome> {
        if state.status == CompensationStatus::Completed {
            tracing::warn!(order_id, reason, "Enrollment already completed, skipping compensation");
            return Ok(CompensationOutcome::AlreadyCompleted);
        }

        if self.failures.find_unresolved(order_id).await?.is_some() {
            tracing::info!(order_id, "Failed enrollment already recorded");
            return Ok(CompensationOutcome::AlreadyRecorded);
        }

        let record = NewFailedEnrollment {
            order_id: order_id.to_string(),
            moodle_user_id: state.moodle_user_id,
            failure_reason: reason.to_string(),
            user_data: serde_json::to_value(&state)?,
        };

        let Some(row) = self.failures.create_if_absent(&record).await? else {
            tracing::info!(order_id, "Failed enrollment recorded concurrently");
            return Ok(CompensationOutcome::AlreadyRecorded);
        };

        state.status = CompensationStatus::Failed;
        state.failed_at = Some(OffsetDateTime::now_utc());
        state.failure_reason = Some(reason.to_string());
        self.store_state(order_id, &state, FAILED_TTL).await;

        tracing::error!(
            order_id,
            moodle_user_id = state.moodle_user_id,
            failed_enrollment_id = %row.id,
            reason,
            "Enrollment failed, flagged for manual review"
        );

        Ok(CompensationOutcome::Recorded(row.id))
    }

    /// Re-attempt enrollment for every unresolved record created within
    /// `window`. Returns how many succeeded; failures are left untouched.
    pub async fn retry_failed_enrollments(&self, window: Duration) -> EnrollmentResult<usize> {
        let pending = self.failures.find_pending_retries(window).await?;
        if pending.is_empty() {
            tracing::debug!("No failed enrollments to retry");
            return Ok(0);
        }

        tracing::info!(count = pending.len(), "Retrying failed enrollments");

        let mut retried = 0;
        for failed in pending {
            self.transition(&failed.order_id, EnrollmentState::Enrolling, None)
                .await;
            let enrolled = self
                .moodle
                .enroll_user(failed.moodle_user_id, self.default_course_id, self.student_role_id)
                .await;

            if let Err(e) = enrolled {
                tracing::warn!(
                    order_id = %failed.order_id,
                    moodle_user_id = failed.moodle_user_id,
                    error = %e,
                    error_kind = %e.kind(),
                    "Retry of failed enrollment did not succeed"
                );
                let reason = e.to_string();
                self.transition(&failed.order_id, EnrollmentState::EnrollmentFailed, Some(&reason))
                    .await;
                continue;
            }

            if let Err(e) = self.failures.mark_resolved(failed.id).await {
                tracing::error!(
                    order_id = %failed.order_id,
                    failed_enrollment_id = %failed.id,
                    error = %e,
                    "Enrolled on retry but could not mark record resolved"
                );
                continue;
            }

            self.mark_enrollment_success(&failed.order_id).await;
            self.transition(&failed.order_id, EnrollmentState::Enrolled, None)
                .await;
            retried += 1;

            tracing::info!(
                order_id = %failed.order_id,
                moodle_user_id = failed.moodle_user_id,
                course_id = self.default_course_id,
                "Failed enrollment recovered"
            );
        }

        Ok(retried)
    }

    async fn transition(&self, order_id: &str, state: EnrollmentState, detail: Option<&str>) {
        if let Err(e) = self.workflow.advance(order_id, state, detail).await {
            tracing::warn!(order_id, state = %state, error = %e, "Workflow state not updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failed_enrollment::InMemoryFailedEnrollmentRepository;
    use crate::testing::FakeMoodle;
    use coursebridge_shared::InMemoryStore;

    fn service(
        moodle: Arc<FakeMoodle>,
    ) -> (CompensationService, Arc<InMemoryFailedEnrollmentRepository>) {
        let failures = Arc::new(InMemoryFailedEnrollmentRepository::new());
        let service = CompensationService::new(
            Arc::new(InMemoryStore::new()),
            failures.clone(),
            moodle,
            2,
            5,
        );
        (service, failures)
    }

    #[tokio::test]
    async fn test_record_user_creation_preserves_created_at() {
        let (service, _) = service(Arc::new(FakeMoodle::new()));
        service.record_user_creation(100, "ord-1").await;
        let first = service.state("ord-1").await.unwrap();

        service.mark_enrollment_success("ord-1").await;
        service.record_user_creation(100, "ord-1").await;
        let second = service.state("ord-1").await.unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.status, CompensationStatus::PendingEnrollment);
        assert_eq!(second.completed_at, None);
    }

    #[tokio::test]
    async fn test_mark_success_without_state_is_noop() {
        let (service, _) = service(Arc::new(FakeMoodle::new()));
        service.mark_enrollment_success("missing").await;
        assert!(service.state("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_compensate_without_state_writes_nothing() {
        let (service, failures) = service(Arc::new(FakeMoodle::new()));
        let outcome = service
            .compensate_failed_enrollment("ord-x", "boom")
            .await
            .unwrap();

        assert_eq!(outcome, CompensationOutcome::NoState);
        assert!(failures.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_compensate_for_user_survives_cache_loss() {
        let (service, failures) = service(Arc::new(FakeMoodle::new()));
        let outcome = service
            .compensate_failed_enrollment_for_user("ord-x", 55, "timeout")
            .await
            .unwrap();

        assert!(matches!(outcome, CompensationOutcome::Recorded(_)));
        let rows = failures.all().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].moodle_user_id, 55);
        assert_eq!(
            service.state("ord-x").await.unwrap().status,
            CompensationStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_compensate_after_completion_is_skipped() {
        let (service, failures) = service(Arc::new(FakeMoodle::new()));
        service.record_user_creation(100, "ord-1").await;
        service.mark_enrollment_success("ord-1").await;

        let outcome = service
            .compensate_failed_enrollment("ord-1", "late failure")
            .await
            .unwrap();

        assert_eq!(outcome, CompensationOutcome::AlreadyCompleted);
        assert!(failures.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_captures_state_before_failure() {
        let (service, failures) = service(Arc::new(FakeMoodle::new()));
        service.record_user_creation(100, "ord-1").await;
        service
            .compensate_failed_enrollment("ord-1", "course full")
            .await
            .unwrap();

        let row = &failures.all().await[0];
        let snapshot = row.user_data.as_ref().unwrap();
        assert_eq!(snapshot["moodle_user_id"], 100);
        assert_eq!(snapshot["status"], "pending_enrollment");
    }

    #[tokio::test]
    async fn test_retry_leaves_failed_rows_untouched() {
        let moodle = Arc::new(FakeMoodle::new());
        moodle.fail_enrollments_for(100).await;
        let (service, failures) = service(moodle.clone());

        service.record_user_creation(100, "ord-1").await;
        service.compensate_failed_enrollment("ord-1", "course full").await.unwrap();

        let retried = service.retry_failed_enrollments(DEFAULT_RETRY_WINDOW).await.unwrap();
        assert_eq!(retried, 0);
        assert!(failures.all().await[0].is_unresolved());
        assert_eq!(
            service.state("ord-1").await.unwrap().status,
            CompensationStatus::Failed
        );
    }
}
