//! Durable background job queue
//!
//! Jobs are claimed in batches and moved to `running`; a worker that dies
//! mid-job leaves the row `running` until [`JobQueue::recover_stuck`] puts it
//! back, which gives at-least-once delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EnrollmentError, EnrollmentResult};
use crate::intake::OrderPaid;
use crate::moodle::MoodleUser;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnrollmentJob {
    CreateMoodleUser { order: OrderPaid },
    /// Published once the Moodle account is known.
    EnrollUser { user: MoodleUser, order: OrderPaid },
}

impl EnrollmentJob {
    pub fn kind(&self) -> &'static str {
        match self {
            EnrollmentJob::CreateMoodleUser { .. } => "create_moodle_user",
            EnrollmentJob::EnrollUser { .. } => "enroll_user",
        }
    }

    pub fn order(&self) -> &OrderPaid {
        match self {
            EnrollmentJob::CreateMoodleUser { order } | EnrollmentJob::EnrollUser { order, .. } => {
                order
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> EnrollmentResult<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(EnrollmentError::Serialization(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub job: EnrollmentJob,
    pub status: JobStatus,
    /// Attempts started so far, including the current one once claimed.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub run_at: OffsetDateTime,
}

impl QueuedJob {
    pub fn order_id(&self) -> &str {
        &self.job.order().order_id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &EnrollmentJob, delay: Duration) -> EnrollmentResult<Uuid>;

    /// Move up to `limit` due jobs to `running`, counting the attempt.
    async fn claim_due(&self, limit: usize) -> EnrollmentResult<Vec<QueuedJob>>;

    async fn complete(&self, id: Uuid) -> EnrollmentResult<()>;

    async fn retry_later(&self, id: Uuid, delay: Duration, error: &str) -> EnrollmentResult<()>;

    async fn fail_permanently(&self, id: Uuid, error: &str) -> EnrollmentResult<()>;

    /// Re-queue jobs that have been `running` for longer than `older_than`.
    async fn recover_stuck(&self, older_than: Duration) -> EnrollmentResult<u64>;

    async fn counts(&self) -> EnrollmentResult<QueueCounts>;
}

// =============================================================================
// PostgreSQL
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    payload: Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    run_at: OffsetDateTime,
}

impl TryFrom<JobRow> for QueuedJob {
    type Error = EnrollmentError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(QueuedJob {
            id: row.id,
            job: serde_json::from_value(row.payload)?,
            status: JobStatus::parse(&row.status)?,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            run_at: row.run_at,
        })
    }
}

pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: &EnrollmentJob, delay: Duration) -> EnrollmentResult<Uuid> {
        let payload = serde_json::to_value(job)?;
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO enrollment_jobs (order_id, kind, payload, run_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            RETURNING id
            "#,
        )
        .bind(&job.order().order_id)
        .bind(job.kind())
        .bind(payload)
        .bind(delay.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))?;

        Ok(id)
    }

    async fn claim_due(&self, limit: usize) -> EnrollmentResult<Vec<QueuedJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE enrollment_jobs
            SET status = 'running', attempts = attempts + 1, started_at = NOW()
            WHERE id IN (
                SELECT id FROM enrollment_jobs
                WHERE status = 'pending' AND run_at <= NOW()
                ORDER BY run_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, status, attempts, last_error, run_at
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))?;

        rows.into_iter().map(QueuedJob::try_from).collect()
    }

    async fn complete(&self, id: Uuid) -> EnrollmentResult<()> {
        sqlx::query(
            "UPDATE enrollment_jobs SET status = 'completed', finished_at = NOW(), last_error = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))?;
        Ok(())
    }

    async fn retry_later(&self, id: Uuid, delay: Duration, error: &str) -> EnrollmentResult<()> {
        sqlx::query(
            r#"
            UPDATE enrollment_jobs
            SET status = 'pending',
                run_at = NOW() + make_interval(secs => $2),
                last_error = $3,
                started_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))?;
        Ok(())
    }

    async fn fail_permanently(&self, id: Uuid, error: &str) -> EnrollmentResult<()> {
        sqlx::query(
            "UPDATE enrollment_jobs SET status = 'failed', finished_at = NOW(), last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))?;
        Ok(())
    }

    async fn recover_stuck(&self, older_than: Duration) -> EnrollmentResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE enrollment_jobs
            SET status = 'pending', started_at = NULL, last_error = 'recovered after worker stall'
            WHERE status = 'running'
              AND started_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn counts(&self) -> EnrollmentResult<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM enrollment_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| EnrollmentError::Database(e.to_string()))?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            match JobStatus::parse(&status)? {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Clone)]
struct Slot {
    job: QueuedJob,
    started_at: Option<OffsetDateTime>,
}

#[derive(Default, Clone)]
pub struct InMemoryJobQueue {
    slots: Arc<Mutex<Vec<Slot>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every pending job due now.
    pub async fn force_due(&self) {
        let now = OffsetDateTime::now_utc();
        for slot in self.slots.lock().await.iter_mut() {
            if slot.job.status == JobStatus::Pending {
                slot.job.run_at = now;
            }
        }
    }

    /// Pretend running jobs were started `ago`.
    pub async fn backdate_running(&self, ago: Duration) {
        let started = OffsetDateTime::now_utc() - ago;
        for slot in self.slots.lock().await.iter_mut() {
            if slot.job.status == JobStatus::Running {
                slot.started_at = Some(started);
            }
        }
    }

    pub async fn jobs(&self) -> Vec<QueuedJob> {
        self.slots.lock().await.iter().map(|s| s.job.clone()).collect()
    }

    async fn update<F>(&self, id: Uuid, f: F) -> EnrollmentResult<()>
    where
        F: FnOnce(&mut Slot) + Send,
    {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .iter_mut()
            .find(|s| s.job.id == id)
            .ok_or_else(|| EnrollmentError::NotFound(format!("job {id}")))?;
        f(slot);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &EnrollmentJob, delay: Duration) -> EnrollmentResult<Uuid> {
        let id = Uuid::new_v4();
        self.slots.lock().await.push(Slot {
            job: QueuedJob {
                id,
                job: job.clone(),
                status: JobStatus::Pending,
                attempts: 0,
                last_error: None,
                run_at: OffsetDateTime::now_utc() + delay,
            },
            started_at: None,
        });
        Ok(id)
    }

    async fn claim_due(&self, limit: usize) -> EnrollmentResult<Vec<QueuedJob>> {
        let now = OffsetDateTime::now_utc();
        let mut slots = self.slots.lock().await;

        let mut due: Vec<&mut Slot> = slots
            .iter_mut()
            .filter(|s| s.job.status == JobStatus::Pending && s.job.run_at <= now)
            .collect();
        due.sort_by_key(|s| s.job.run_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|slot| {
                slot.job.status = JobStatus::Running;
                slot.job.attempts += 1;
                slot.started_at = Some(now);
                slot.job.clone()
            })
            .collect())
    }

    async fn complete(&self, id: Uuid) -> EnrollmentResult<()> {
        self.update(id, |slot| {
            slot.job.status = JobStatus::Completed;
            slot.job.last_error = None;
        })
        .await
    }

    async fn retry_later(&self, id: Uuid, delay: Duration, error: &str) -> EnrollmentResult<()> {
        let error = error.to_string();
        self.update(id, move |slot| {
            slot.job.status = JobStatus::Pending;
            slot.job.run_at = OffsetDateTime::now_utc() + delay;
            slot.job.last_error = Some(error);
            slot.started_at = None;
        })
        .await
    }

    async fn fail_permanently(&self, id: Uuid, error: &str) -> EnrollmentResult<()> {
        let error = error.to_string();
        self.update(id, move |slot| {
            slot.job.status = JobStatus::Failed;
            slot.job.last_error = Some(error);
        })
        .await
    }

    async fn recover_stuck(&self, older_than: Duration) -> EnrollmentResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - older_than;
        let mut recovered = 0;
        for slot in self.slots.lock().await.iter_mut() {
            if slot.job.status == JobStatus::Running && slot.started_at.is_some_and(|t| t < cutoff) {
                slot.job.status = JobStatus::Pending;
                slot.job.last_error = Some("recovered after worker stall".to_string());
                slot.started_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn counts(&self) -> EnrollmentResult<QueueCounts> {
        let mut counts = QueueCounts::default();
        for slot in self.slots.lock().await.iter() {
            match slot.job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
