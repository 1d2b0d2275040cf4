//! Durable record of enrollments that failed after the Moodle user was created
//!
//! At most one unresolved row exists per order. Creation is insert-if-absent
//! against the partial unique index, so reporting the same failure twice is safe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EnrollmentError, EnrollmentResult};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FailedEnrollment {
    pub id: Uuid,
    pub order_id: String,
    pub moodle_user_id: i64,
    pub failure_reason: String,
    pub requires_manual_review: bool,
    /// Snapshot of the compensation state at failure time.
    pub user_data: Option<Value>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl FailedEnrollment {
    pub fn is_unresolved(&self) -> bool {
        self.requires_manual_review && self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewFailedEnrollment {
    pub order_id: String,
    pub moodle_user_id: i64,
    pub failure_reason: String,
    pub user_data: Value,
}

#[async_trait]
pub trait FailedEnrollmentRepository: Send + Sync {
    /// Insert unless an unresolved record exists for the order.
    /// Returns the new row, or `None` when one was already open.
    async fn create_if_absent(
        &self,
        record: &NewFailedEnrollment,
    ) -> EnrollmentResult<Option<FailedEnrollment>>;

    async fn find_unresolved(&self, order_id: &str) -> EnrollmentResult<Option<FailedEnrollment>>;

    /// Rows still flagged for review and created within `window`, oldest first.
    async fn find_pending_retries(&self, window: Duration) -> EnrollmentResult<Vec<FailedEnrollment>>;

    async fn mark_resolved(&self, id: Uuid) -> EnrollmentResult<()>;

    async fn count_unresolved(&self) -> EnrollmentResult<i64>;
}

pub struct PgFailedEnrollmentRepository {
    pool: PgPool,
}

impl PgFailedEnrollmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailedEnrollmentRepository for PgFailedEnrollmentRepository {
    async fn create_if_absent(
        &self,
        record: &NewFailedEnrollment,
    ) -> EnrollmentResult<Option<FailedEnrollment>> {
        sqlx::query_as::<_, FailedEnrollment>(
            r#"
            INSERT INTO failed_enrollments (order_id, moodle_user_id, failure_reason, requires_manual_review, user_data)
            VALUES ($1, $2, $3, TRUE, $4)
            ON CONFLICT (order_id) WHERE requires_manual_review AND resolved_at IS NULL
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&record.order_id)
        .bind(record.moodle_user_id)
        .bind(&record.failure_reason)
        .bind(&record.user_data)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))
    }

    async fn find_unresolved(&self, order_id: &str) -> EnrollmentResult<Option<FailedEnrollment>> {
        sqlx::query_as::<_, FailedEnrollment>(
            r#"
            SELECT * FROM failed_enrollments
            WHERE order_id = $1 AND requires_manual_review AND resolved_at IS NULL
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))
    }

    async fn find_pending_retries(&self, window: Duration) -> EnrollmentResult<Vec<FailedEnrollment>> {
        sqlx::query_as::<_, FailedEnrollment>(
            r#"
            SELECT * FROM failed_enrollments
            WHERE requires_manual_review
              AND created_at > NOW() - make_interval(secs => $1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(window.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))
    }

    async fn mark_resolved(&self, id: Uuid) -> EnrollmentResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE failed_enrollments
            SET requires_manual_review = FALSE, resolved_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(EnrollmentError::NotFound(format!("failed enrollment {id}")));
        }
        Ok(())
    }

    async fn count_unresolved(&self) -> EnrollmentResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM failed_enrollments WHERE requires_manual_review AND resolved_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))
    }
}

#[derive(Default, Clone)]
pub struct InMemoryFailedEnrollmentRepository {
    rows: Arc<Mutex<Vec<FailedEnrollment>>>,
}

impl InMemoryFailedEnrollmentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an unresolved row dated `created_at`, bypassing the uniqueness check.
    pub async fn insert_created_at(
        &self,
        record: &NewFailedEnrollment,
        created_at: OffsetDateTime,
    ) -> FailedEnrollment {
        let row = new_row(record, created_at);
        self.rows.lock().await.push(row.clone());
        row
    }

    pub async fn all(&self) -> Vec<FailedEnrollment> {
        self.rows.lock().await.clone()
    }
}

fn new_row(record: &NewFailedEnrollment, created_at: OffsetDateTime) -> FailedEnrollment {
    FailedEnrollment {
        id: Uuid::new_v4(),
        order_id: record.order_id.clone(),
        moodle_user_id: record.moodle_user_id,
        failure_reason: record.failure_reason.clone(),
        requires_manual_review: true,
        user_data: Some(record.user_data.clone()),
        resolved_at: None,
        created_at,
        updated_at: created_at,
    }
}

#[async_trait]
impl FailedEnrollmentRepository for InMemoryFailedEnrollmentRepository {
    async fn create_if_absent(
        &self,
        record: &NewFailedEnrollment,
    ) -> EnrollmentResult<Option<FailedEnrollment>> {
        let mut rows = self.rows.lock().await;
        if rows
            .iter()
            .any(|r| r.order_id == record.order_id && r.is_unresolved())
        {
            return Ok(None);
        }
        let row = new_row(record, OffsetDateTime::now_utc());
        rows.push(row.clone());
        Ok(Some(row))
    }

    async fn find_unresolved(&self, order_id: &str) -> EnrollmentResult<Option<FailedEnrollment>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .find(|r| r.order_id == order_id && r.is_unresolved())
            .cloned())
    }

    async fn find_pending_retries(&self, window: Duration) -> EnrollmentResult<Vec<FailedEnrollment>> {
        let cutoff = OffsetDateTime::now_utc() - window;
        let rows = self.rows.lock().await;
        let mut pending: Vec<FailedEnrollment> = rows
            .iter()
            .filter(|r| r.requires_manual_review && r.created_at > cutoff)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn mark_resolved(&self, id: Uuid) -> EnrollmentResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| EnrollmentError::NotFound(format!("failed enrollment {id}")))?;
        row.requires_manual_review = false;
        row.resolved_at = Some(now);
        row.updated_at = now;
        Ok(())
    }

    async fn count_unresolved(&self) -> EnrollmentResult<i64> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().filter(|r| r.is_unresolved()).count() as i64)
    }
}
