// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Enrollment Pipeline
//!
//! Tests critical boundary conditions and race conditions in:
//! - Webhook idempotency (claims, duplicate orders, repeat customers)
//! - Compensation (idempotent failure records, state monotonicity, retry sweep)
//! - Rate limiting (window boundary, reset, parallel hits)
//! - Job execution (retries, timeouts, permanent failure hooks)

use std::sync::Arc;
use std::time::Duration;

use coursebridge_shared::InMemoryStore;
use serde_json::{json, Value};

use crate::compensation::CompensationStatus;
use crate::config::JobConfig;
use crate::failed_enrollment::InMemoryFailedEnrollmentRepository;
use crate::idempotency::{InMemoryIdentityStore, InMemoryWebhookLedger};
use crate::intake::{parse_order_paid, IntakeOutcome, OrderPaid};
use crate::queue::InMemoryJobQueue;
use crate::testing::FakeMoodle;
use crate::{EnrollmentParts, EnrollmentService};

struct Harness {
    service: EnrollmentService,
    moodle: Arc<FakeMoodle>,
    ledger: Arc<InMemoryWebhookLedger>,
    identities: Arc<InMemoryIdentityStore>,
    failures: Arc<InMemoryFailedEnrollmentRepository>,
    queue: Arc<InMemoryJobQueue>,
}

fn harness_with(jobs: JobConfig) -> Harness {
    let moodle = Arc::new(FakeMoodle::new());
    let ledger = Arc::new(InMemoryWebhookLedger::new());
    let identities = Arc::new(InMemoryIdentityStore::new());
    let failures = Arc::new(InMemoryFailedEnrollmentRepository::new());
    let queue = Arc::new(InMemoryJobQueue::new());

    let service = EnrollmentService::new(EnrollmentParts {
        store: Arc::new(InMemoryStore::new()),
        moodle: moodle.clone(),
        ledger: ledger.clone(),
        identities: identities.clone(),
        failures: failures.clone(),
        queue: queue.clone(),
        default_course_id: 2,
        student_role_id: 5,
        jobs,
    });

    Harness {
        service,
        moodle,
        ledger,
        identities,
        failures,
        queue,
    }
}

fn harness() -> Harness {
    harness_with(JobConfig {
        enroll_delay: Duration::ZERO,
        ..JobConfig::default()
    })
}

fn order_payload(order_id: &str, email: &str, courses: &[i64]) -> Value {
    let items: Vec<Value> = courses
        .iter()
        .enumerate()
        .map(|(i, course)| json!({"id": format!("li_{i}"), "metadata": {"moodle_course_id": course}}))
        .collect();
    json!({
        "id": order_id,
        "customer": {"email": email, "first_name": "Ana", "last_name": "Diaz"},
        "items": items
    })
}

fn order(order_id: &str, webhook_id: &str, email: &str, courses: &[i64]) -> (OrderPaid, Value) {
    let payload = order_payload(order_id, email, courses);
    (parse_order_paid(&payload, Some(webhook_id)).unwrap(), payload)
}

#[cfg(test)]
mod idempotency_tests {
    use super::*;
    use crate::idempotency::{IdempotencyDecision, IdentityStore, NewWebhookRecord};
    use tokio::sync::Barrier;

    fn record(webhook_id: &str, order_id: &str) -> NewWebhookRecord {
        NewWebhookRecord::order_paid(webhook_id, order_id, Some("a@x.com".into()), json!({}))
    }

    // =========================================================================
    // New order is accepted once, then the same webhook id is a duplicate
    // =========================================================================
    #[tokio::test]
    async fn test_new_webhook_then_duplicate_webhook() {
        let h = harness();
        let idempotency = &h.service.idempotency;

        let decision = idempotency.can_process("wh-1", "ord-1", "a@x.com").await.unwrap();
        assert_eq!(decision, IdempotencyDecision::NewWebhook);
        assert_eq!(decision.reason(), "new_webhook");

        assert!(idempotency.claim(&record("wh-1", "ord-1")).await.unwrap());

        let decision = idempotency.can_process("wh-1", "ord-1", "a@x.com").await.unwrap();
        assert_eq!(decision.reason(), "duplicate_webhook");
    }

    // =========================================================================
    // A released claim makes the webhook new again
    // =========================================================================
    #[tokio::test]
    async fn test_released_claim_can_be_claimed_again() {
        let h = harness();
        let idempotency = &h.service.idempotency;
        assert!(idempotency.claim(&record("wh-1", "ord-1")).await.unwrap());

        assert!(idempotency.release("wh-1").await.unwrap());
        assert!(!idempotency.release("wh-1").await.unwrap());

        let decision = idempotency.can_process("wh-1", "ord-1", "a@x.com").await.unwrap();
        assert_eq!(decision, IdempotencyDecision::NewWebhook);
        assert!(idempotency.claim(&record("wh-1", "ord-1")).await.unwrap());
    }

    // =========================================================================
    // Same order under a new webhook id within 24h is a duplicate order
    // =========================================================================
    #[tokio::test]
    async fn test_same_order_new_webhook_is_duplicate_order() {
        let h = harness();
        let idempotency = &h.service.idempotency;
        idempotency.claim(&record("wh-1", "ord-1")).await.unwrap();

        let decision = idempotency.can_process("wh-2", "ord-1", "a@x.com").await.unwrap();
        assert_eq!(decision, IdempotencyDecision::DuplicateOrder);
    }

    // =========================================================================
    // Repeat customer: user_exists carries the identity, linking updates the order
    // =========================================================================
    #[tokio::test]
    async fn test_existing_customer_is_linked_to_new_order() {
        let h = harness();
        h.identities.upsert("a@x.com", "Ana Diaz", 42, "ord-1").await.unwrap();

        let decision = h
            .service
            .idempotency
            .can_process("wh-3", "ord-2", "a@x.com")
            .await
            .unwrap();
        let IdempotencyDecision::UserExists(identity) = decision else {
            panic!("expected user_exists");
        };
        assert_eq!(identity.moodle_user_id, Some(42));

        h.service
            .idempotency
            .link_existing_identity(&identity, "ord-2")
            .await
            .unwrap();

        let stored = h.identities.find_by_email("a@x.com").await.unwrap().unwrap();
        assert_eq!(stored.medusa_order_id.as_deref(), Some("ord-2"));
    }

    // =========================================================================
    // Sequential claims: exactly one true, exactly one record
    // =========================================================================
    #[tokio::test]
    async fn test_sequential_claims_single_winner() {
        let h = harness();
        assert!(h.service.idempotency.claim(&record("wh-1", "ord-1")).await.unwrap());
        assert!(!h.service.idempotency.claim(&record("wh-1", "ord-1")).await.unwrap());
        assert!(!h.service.idempotency.claim(&record("wh-9", "ord-1")).await.unwrap());
        assert!(!h.service.idempotency.claim(&record("wh-1", "ord-9")).await.unwrap());
        assert_eq!(h.ledger.len().await, 1);
    }

    // =========================================================================
    // Concurrent claims on one webhook id: exactly one true
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_same_webhook() {
        let h = harness();
        let barrier = Arc::new(Barrier::new(16));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let idempotency = h.service.idempotency.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                idempotency.claim(&record("wh-race", "ord-race")).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1, "exactly one concurrent claim should win");
        assert_eq!(h.ledger.len().await, 1);
    }

    // =========================================================================
    // Concurrent claims on one order under distinct webhook ids: exactly one true
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_same_order_distinct_webhooks() {
        let h = harness();
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();

        for i in 0..8 {
            let idempotency = h.service.idempotency.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                idempotency
                    .claim(&record(&format!("wh-{i}"), "ord-shared"))
                    .await
                    .unwrap()
            }));
        }

        let results: Vec<bool> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|won| **won).count(), 1);
        assert_eq!(h.ledger.len().await, 1);
    }
}

#[cfg(test)]
mod compensation_tests {
    use super::*;
    use crate::compensation::{CompensationOutcome, DEFAULT_RETRY_WINDOW};
    use crate::failed_enrollment::NewFailedEnrollment;
    use time::OffsetDateTime;

    // =========================================================================
    // User created, enrollment failed: durable record plus failed cache state
    // =========================================================================
    #[tokio::test]
    async fn test_compensation_records_failure() {
        let h = harness();
        let compensation = &h.service.compensation;

        compensation.record_user_creation(100, "ord-3").await;
        let outcome = compensation
            .compensate_failed_enrollment("ord-3", "course full")
            .await
            .unwrap();
        assert!(matches!(outcome, CompensationOutcome::Recorded(_)));

        let rows = h.failures.all().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].moodle_user_id, 100);
        assert!(rows[0].requires_manual_review);
        assert_eq!(rows[0].failure_reason, "course full");

        let state = compensation.state("ord-3").await.unwrap();
        assert_eq!(state.status, CompensationStatus::Failed);
        assert_eq!(state.failure_reason.as_deref(), Some("course full"));
        assert!(state.failed_at.is_some());
    }

    // =========================================================================
    // Reporting the same failure twice writes one row
    // =========================================================================
    #[tokio::test]
    async fn test_compensation_is_idempotent() {
        let h = harness();
        let compensation = &h.service.compensation;
        compensation.record_user_creation(100, "ord-3").await;

        compensation.compensate_failed_enrollment("ord-3", "course full").await.unwrap();
        let second = compensation
            .compensate_failed_enrollment("ord-3", "course full")
            .await
            .unwrap();

        assert_eq!(second, CompensationOutcome::AlreadyRecorded);
        assert_eq!(h.failures.all().await.len(), 1);
    }

    // =========================================================================
    // Concurrent reports for one order still write one row
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_compensation_single_row() {
        let h = harness();
        h.service.compensation.record_user_creation(100, "ord-3").await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let compensation = h.service.compensation.clone();
                tokio::spawn(async move {
                    compensation
                        .compensate_failed_enrollment("ord-3", "course full")
                        .await
                        .unwrap()
                })
            })
            .collect();
        futures::future::join_all(handles).await;

        assert_eq!(h.failures.all().await.len(), 1);
    }

    // =========================================================================
    // Completed and failed never fall back to pending on their own
    // =========================================================================
    #[tokio::test]
    async fn test_state_is_monotonic() {
        let h = harness();
        let compensation = &h.service.compensation;

        compensation.record_user_creation(100, "ord-4").await;
        compensation.mark_enrollment_success("ord-4").await;
        compensation.compensate_failed_enrollment("ord-4", "late").await.unwrap();
        assert_eq!(
            compensation.state("ord-4").await.unwrap().status,
            CompensationStatus::Completed
        );

        compensation.record_user_creation(200, "ord-5").await;
        compensation.compensate_failed_enrollment("ord-5", "boom").await.unwrap();
        compensation.mark_enrollment_success("ord-5").await;
        assert_eq!(
            compensation.state("ord-5").await.unwrap().status,
            CompensationStatus::Completed
        );

        // Only an explicit new user creation restarts the workflow
        compensation.record_user_creation(200, "ord-5").await;
        assert_eq!(
            compensation.state("ord-5").await.unwrap().status,
            CompensationStatus::PendingEnrollment
        );
    }

    // =========================================================================
    // Retry sweep resolves the record and completes the cached state
    // =========================================================================
    #[tokio::test]
    async fn test_retry_sweep_resolves_failure() {
        let h = harness();
        let compensation = &h.service.compensation;
        compensation.record_user_creation(100, "ord-3").await;
        compensation.compensate_failed_enrollment("ord-3", "course full").await.unwrap();

        let retried = h.service.retry_failed_enrollments(7).await.unwrap();
        assert_eq!(retried, 1);

        let row = &h.failures.all().await[0];
        assert!(!row.requires_manual_review);
        assert!(row.resolved_at.is_some());
        assert_eq!(
            compensation.state("ord-3").await.unwrap().status,
            CompensationStatus::Completed
        );
        assert!(h.moodle.is_enrolled(100, 2).await, "sweep enrolls into the default course");

        // Nothing left to retry
        assert_eq!(h.service.retry_failed_enrollments(7).await.unwrap(), 0);
    }

    // =========================================================================
    // Retry sweep only touches rows inside the window
    // =========================================================================
    #[tokio::test]
    async fn test_retry_sweep_respects_window() {
        let h = harness();
        let now = OffsetDateTime::now_utc();
        let old = h
            .failures
            .insert_created_at(
                &NewFailedEnrollment {
                    order_id: "ord-old".into(),
                    moodle_user_id: 1,
                    failure_reason: "x".into(),
                    user_data: json!({}),
                },
                now - Duration::from_secs(8 * 24 * 3600),
            )
            .await;
        h.failures
            .insert_created_at(
                &NewFailedEnrollment {
                    order_id: "ord-new".into(),
                    moodle_user_id: 2,
                    failure_reason: "x".into(),
                    user_data: json!({}),
                },
                now - Duration::from_secs(24 * 3600),
            )
            .await;

        let retried = h
            .service
            .compensation
            .retry_failed_enrollments(DEFAULT_RETRY_WINDOW)
            .await
            .unwrap();
        assert_eq!(retried, 1);

        let rows = h.failures.all().await;
        let old_row = rows.iter().find(|r| r.id == old.id).unwrap();
        assert!(old_row.is_unresolved());
        assert!(!h.moodle.is_enrolled(1, 2).await);
        assert!(h.moodle.is_enrolled(2, 2).await);
    }
}

#[cfg(test)]
mod rate_limit_tests {
    use crate::config::RateLimitConfig;
    use crate::rate_limit::{RateLimiter, GLOBAL_IDENTIFIER};
    use coursebridge_shared::InMemoryStore;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn limiter(max_attempts: u32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(InMemoryStore::new()),
            RateLimitConfig {
                enabled: true,
                max_attempts,
                decay_seconds: 60,
            },
        )
    }

    // =========================================================================
    // N attempt+hit cycles succeed, the N+1th attempt is rejected
    // =========================================================================
    #[tokio::test]
    async fn test_boundary_at_max_attempts() {
        let limiter = limiter(5);
        for i in 0..5 {
            assert!(
                limiter.attempt(GLOBAL_IDENTIFIER).await.is_ok(),
                "call {i} should be allowed"
            );
            limiter.hit(GLOBAL_IDENTIFIER).await;
        }

        assert_eq!(limiter.remaining(GLOBAL_IDENTIFIER).await, 0);
        let err = limiter.attempt(GLOBAL_IDENTIFIER).await.unwrap_err();
        assert_eq!(err.max_attempts, 5);
    }

    // =========================================================================
    // Reset restores the full budget
    // =========================================================================
    #[tokio::test]
    async fn test_reset_restores_budget() {
        let limiter = limiter(5);
        for _ in 0..5 {
            limiter.hit(GLOBAL_IDENTIFIER).await;
        }
        assert!(limiter.attempt(GLOBAL_IDENTIFIER).await.is_err());

        limiter.reset(GLOBAL_IDENTIFIER).await.unwrap();
        assert_eq!(limiter.remaining(GLOBAL_IDENTIFIER).await, 5);
        assert!(limiter.attempt(GLOBAL_IDENTIFIER).await.is_ok());
    }

    // =========================================================================
    // Parallel hits are all counted
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_hits_are_counted() {
        let limiter = limiter(60);
        let barrier = Arc::new(Barrier::new(10));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    limiter.hit(GLOBAL_IDENTIFIER).await;
                })
            })
            .collect();
        futures::future::join_all(handles).await;

        assert_eq!(limiter.remaining(GLOBAL_IDENTIFIER).await, 50);
    }
}

#[cfg(test)]
mod workflow_tests {
    use super::*;
    use crate::idempotency::IdentityStore;
    use crate::jobs::JobOutcome;
    use crate::moodle::{MoodleApi, MoodleResult, MoodleUser, NewMoodleUser, SiteInfo};
    use crate::queue::{EnrollmentJob, JobQueue, JobStatus};
    use crate::workflow::EnrollmentState;
    use crate::error::{EnrollmentError, EnrollmentResult};
    use crate::JobRunner;
    use async_trait::async_trait;
    use uuid::Uuid;

    async fn workflow_state(h: &Harness, order_id: &str) -> EnrollmentState {
        h.service
            .workflow
            .current(order_id)
            .await
            .unwrap()
            .unwrap()
            .state
    }

    // =========================================================================
    // Webhook to enrollment, end to end
    // =========================================================================
    #[tokio::test]
    async fn test_order_paid_end_to_end() {
        let h = harness();
        let (order, payload) = order("ord-1", "wh-1", "a@x.com", &[7, 12, 7]);

        let outcome = h.service.intake.handle_order_paid(&order, &payload).await.unwrap();
        assert!(matches!(outcome, IntakeOutcome::Queued { .. }));
        assert_eq!(workflow_state(&h, "ord-1").await, EnrollmentState::UserCreating);

        // User creation publishes the enrollment job
        let summary = h.service.jobs.run_due().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(workflow_state(&h, "ord-1").await, EnrollmentState::UserCreated);

        let identity = h.identities.find_by_email("a@x.com").await.unwrap().unwrap();
        let user_id = identity.moodle_user_id.unwrap();
        assert_eq!(identity.medusa_order_id.as_deref(), Some("ord-1"));

        let summary = h.service.jobs.run_due().await.unwrap();
        assert_eq!(summary.completed, 1);

        assert!(h.moodle.is_enrolled(user_id, 7).await);
        assert!(h.moodle.is_enrolled(user_id, 12).await);
        assert_eq!(h.moodle.enroll_calls(), 2, "duplicate course ids are skipped");
        assert_eq!(workflow_state(&h, "ord-1").await, EnrollmentState::Enrolled);
        assert_eq!(
            h.service.compensation.state("ord-1").await.unwrap().status,
            CompensationStatus::Completed
        );

        let counts = h.service.queue.counts().await.unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.pending, 0);
    }

    // =========================================================================
    // Redelivered webhook is acknowledged without new work
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_is_duplicate() {
        let h = harness();
        let (order, payload) = order("ord-1", "wh-1", "a@x.com", &[7]);
        h.service.intake.handle_order_paid(&order, &payload).await.unwrap();

        let outcome = h.service.intake.handle_order_paid(&order, &payload).await.unwrap();
        assert!(matches!(
            outcome,
            IntakeOutcome::Duplicate { reason: "duplicate_webhook", .. }
        ));
        assert_eq!(h.queue.jobs().await.len(), 1);
    }

    // =========================================================================
    // Repeat customer is linked instead of provisioned again
    // =========================================================================
    #[tokio::test]
    async fn test_repeat_customer_is_linked() {
        let h = harness();
        let (first, payload) = order("ord-1", "wh-1", "a@x.com", &[7]);
        h.service.intake.handle_order_paid(&first, &payload).await.unwrap();
        h.service.jobs.run_due().await.unwrap();
        h.service.jobs.run_due().await.unwrap();

        let (second, payload) = order("ord-2", "wh-2", "a@x.com", &[9]);
        let outcome = h.service.intake.handle_order_paid(&second, &payload).await.unwrap();

        let IntakeOutcome::Linked { order_id, moodle_user_id } = outcome else {
            panic!("expected linked outcome");
        };
        assert_eq!(order_id, "ord-2");
        assert!(moodle_user_id.is_some());
        assert_eq!(h.moodle.create_calls(), 1);
        assert_eq!(h.queue.jobs().await.len(), 2, "no new jobs for linked orders");
    }

    // =========================================================================
    // Existing Moodle account and existing enrollment are reused
    // =========================================================================
    #[tokio::test]
    async fn test_existing_account_and_enrollment_are_skipped() {
        let h = harness();
        h.moodle.with_user("a@x.com", 42).await;
        h.moodle.with_enrollment(42, 7).await;

        let (order, payload) = order("ord-1", "wh-1", "a@x.com", &[7, 8]);
        h.service.intake.handle_order_paid(&order, &payload).await.unwrap();
        h.service.jobs.run_due().await.unwrap();
        h.service.jobs.run_due().await.unwrap();

        assert_eq!(h.moodle.create_calls(), 0);
        assert_eq!(h.moodle.enroll_calls(), 1);
        assert!(h.moodle.is_enrolled(42, 8).await);
    }

    // =========================================================================
    // Transient user creation failure is retried on the backoff schedule
    // =========================================================================
    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let h = harness();
        h.moodle.fail_next_creates(1);

        let (order, payload) = order("ord-1", "wh-1", "a@x.com", &[7]);
        h.service.intake.handle_order_paid(&order, &payload).await.unwrap();

        let summary = h.service.jobs.run_due().await.unwrap();
        assert_eq!(summary.retrying, 1);

        let jobs = h.queue.jobs().await;
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert!(jobs[0].last_error.as_deref().unwrap().contains("connection reset"));
        assert!(h.queue.claim_due(10).await.unwrap().is_empty(), "backoff delays the retry");

        h.queue.force_due().await;
        let summary = h.service.jobs.run_due().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(h.moodle.create_calls(), 2);
    }

    // =========================================================================
    // Enrollment failing every attempt ends in compensation
    // =========================================================================
    #[tokio::test]
    async fn test_exhausted_enrollment_is_compensated() {
        let h = harness();
        h.moodle.fail_course(7).await;

        let (order, payload) = order("ord-1", "wh-1", "a@x.com", &[7]);
        h.service.intake.handle_order_paid(&order, &payload).await.unwrap();
        h.service.jobs.run_due().await.unwrap();

        let mut last = None;
        for _ in 0..3 {
            h.queue.force_due().await;
            last = Some(h.service.jobs.run_due().await.unwrap());
        }
        assert_eq!(last.unwrap().failed, 1);
        assert_eq!(h.moodle.enroll_calls(), 3);

        let rows = h.failures.all().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].order_id, "ord-1");
        assert!(rows[0].failure_reason.contains("course full"));
        assert_eq!(workflow_state(&h, "ord-1").await, EnrollmentState::EnrollmentFailed);
        assert_eq!(
            h.service.compensation.state("ord-1").await.unwrap().status,
            CompensationStatus::Failed
        );

        // Operator fixes the course, the sweep recovers the order
        h.moodle.heal().await;
        assert_eq!(h.service.retry_failed_enrollments(7).await.unwrap(), 1);
        assert_eq!(
            h.service.compensation.state("ord-1").await.unwrap().status,
            CompensationStatus::Completed
        );
        assert_eq!(workflow_state(&h, "ord-1").await, EnrollmentState::Enrolled);
    }

    /// Queue whose first enqueue fails, then delegates.
    struct FlakyQueue {
        inner: InMemoryJobQueue,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl JobQueue for FlakyQueue {
        async fn enqueue(&self, job: &EnrollmentJob, delay: Duration) -> EnrollmentResult<Uuid> {
            if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(EnrollmentError::Database("connection closed".into()));
            }
            self.inner.enqueue(job, delay).await
        }

        async fn claim_due(&self, limit: usize) -> EnrollmentResult<Vec<crate::queue::QueuedJob>> {
            self.inner.claim_due(limit).await
        }

        async fn complete(&self, id: Uuid) -> EnrollmentResult<()> {
            self.inner.complete(id).await
        }

        async fn retry_later(&self, id: Uuid, delay: Duration, error: &str) -> EnrollmentResult<()> {
            self.inner.retry_later(id, delay, error).await
        }

        async fn fail_permanently(&self, id: Uuid, error: &str) -> EnrollmentResult<()> {
            self.inner.fail_permanently(id, error).await
        }

        async fn recover_stuck(&self, older_than: Duration) -> EnrollmentResult<u64> {
            self.inner.recover_stuck(older_than).await
        }

        async fn counts(&self) -> EnrollmentResult<crate::queue::QueueCounts> {
            self.inner.counts().await
        }
    }

    // =========================================================================
    // Enqueue failure after the claim: redelivery is processed, not dropped
    // =========================================================================
    #[tokio::test]
    async fn test_enqueue_failure_releases_claim_for_redelivery() {
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryJobQueue::new(),
            fail_next: std::sync::atomic::AtomicBool::new(true),
        });
        let service = EnrollmentService::new(EnrollmentParts {
            store: Arc::new(InMemoryStore::new()),
            moodle: Arc::new(FakeMoodle::new()),
            ledger: Arc::new(InMemoryWebhookLedger::new()),
            identities: Arc::new(InMemoryIdentityStore::new()),
            failures: Arc::new(InMemoryFailedEnrollmentRepository::new()),
            queue: queue.clone(),
            default_course_id: 2,
            student_role_id: 5,
            jobs: JobConfig::default(),
        });

        let (order, payload) = order("ord-1", "wh-1", "a@x.com", &[7]);
        assert!(service.intake.handle_order_paid(&order, &payload).await.is_err());
        assert!(queue.inner.jobs().await.is_empty());

        let outcome = service.intake.handle_order_paid(&order, &payload).await.unwrap();
        assert!(matches!(outcome, IntakeOutcome::Queued { .. }));
        assert_eq!(queue.inner.jobs().await.len(), 1);

        let outcome = service.intake.handle_order_paid(&order, &payload).await.unwrap();
        assert!(matches!(outcome, IntakeOutcome::Duplicate { .. }));
        assert_eq!(queue.inner.jobs().await.len(), 1);
    }

    // =========================================================================
    // A sweep that fails again leaves the order in enrollment_failed
    // =========================================================================
    #[tokio::test]
    async fn test_failed_sweep_returns_order_to_enrollment_failed() {
        let h = harness();
        h.moodle.with_user("a@x.com", 77).await;
        h.moodle.fail_enrollments_for(77).await;

        let (order, payload) = order("ord-1", "wh-1", "a@x.com", &[7]);
        h.service.intake.handle_order_paid(&order, &payload).await.unwrap();
        h.service.jobs.run_due().await.unwrap();
        for _ in 0..3 {
            h.queue.force_due().await;
            h.service.jobs.run_due().await.unwrap();
        }
        assert_eq!(workflow_state(&h, "ord-1").await, EnrollmentState::EnrollmentFailed);

        assert_eq!(h.service.retry_failed_enrollments(7).await.unwrap(), 0);
        let record = h.service.workflow.current("ord-1").await.unwrap().unwrap();
        assert_eq!(record.state, EnrollmentState::EnrollmentFailed);
        assert!(record.detail.is_some());
        assert!(h.failures.all().await[0].resolved_at.is_none());

        h.moodle.heal().await;
        assert_eq!(h.service.retry_failed_enrollments(7).await.unwrap(), 1);
        assert_eq!(workflow_state(&h, "ord-1").await, EnrollmentState::Enrolled);
    }

    // =========================================================================
    // A recovered job past its budget fails without running
    // =========================================================================
    #[tokio::test]
    async fn test_job_past_budget_is_not_executed() {
        let h = harness();
        let (order, _) = order("ord-1", "wh-1", "a@x.com", &[7]);
        let user = MoodleUser {
            id: 77,
            username: "ana".into(),
            email: "a@x.com".into(),
            firstname: "Ana".into(),
            lastname: "Diaz".into(),
            existing: false,
        };
        h.queue
            .enqueue(&EnrollmentJob::EnrollUser { user, order }, Duration::ZERO)
            .await
            .unwrap();

        let mut job = h.queue.claim_due(1).await.unwrap().remove(0);
        job.attempts = 4;

        assert_eq!(h.service.jobs.run_job(job).await, JobOutcome::Failed);
        assert_eq!(h.moodle.enroll_calls(), 0);
        assert_eq!(h.failures.all().await[0].moodle_user_id, 77);
        assert_eq!(h.service.queue.counts().await.unwrap().failed, 1);
    }

    struct StalledMoodle;

    #[async_trait]
    impl MoodleApi for StalledMoodle {
        async fn find_user_by_email(&self, _email: &str) -> MoodleResult<Option<MoodleUser>> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(None)
        }

        async fn create_user(&self, _user: &NewMoodleUser) -> MoodleResult<MoodleUser> {
            unreachable!("lookup never completes")
        }

        async fn enroll_user(&self, _: i64, _: i64, _: i64) -> MoodleResult<()> {
            Ok(())
        }

        async fn is_user_enrolled(&self, _: i64, _: i64) -> MoodleResult<bool> {
            Ok(false)
        }

        async fn get_site_info(&self) -> MoodleResult<SiteInfo> {
            Ok(SiteInfo::default())
        }
    }

    // =========================================================================
    // An attempt that exceeds the job timeout counts as a failed attempt
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_counts_as_attempt() {
        let h = harness();
        let store = Arc::new(InMemoryStore::new());
        let runner = JobRunner::new(
            h.queue.clone(),
            Arc::new(StalledMoodle),
            h.identities.clone(),
            h.service.compensation.clone(),
            crate::workflow::WorkflowTracker::new(store),
            JobConfig {
                job_timeout: Duration::from_secs(120),
                ..JobConfig::default()
            },
            2,
            5,
        );

        let (order, payload) = order("ord-1", "wh-1", "a@x.com", &[7]);
        h.service.intake.handle_order_paid(&order, &payload).await.unwrap();

        let summary = runner.run_due().await.unwrap();
        assert_eq!(summary.retrying, 1);

        let jobs = h.queue.jobs().await;
        assert!(jobs[0].last_error.as_deref().unwrap().contains("timed out after 120"));
    }
}
