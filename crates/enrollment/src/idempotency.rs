//! Webhook idempotency ledger
//!
//! Decides whether an incoming `order.paid` webhook may proceed and records
//! that decision durably. Checks run in a fixed order:
//!
//! 1. webhook id already recorded -> `duplicate_webhook`
//! 2. order id recorded within the last 24 hours -> `duplicate_order`
//! 3. email already mapped to a Moodle account -> `user_exists`
//! 4. otherwise -> `new_webhook`
//!
//! [`IdempotencyService::can_process`] is advisory. The binding decision is
//! [`WebhookLedger::claim`], which re-checks both keys and inserts inside a
//! single transaction so that concurrent deliveries yield exactly one winner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EnrollmentError, EnrollmentResult, ErrorKind};

/// Orders seen within this window are treated as duplicates by `can_process`.
pub const DUPLICATE_ORDER_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

pub const ORDER_PAID_EVENT: &str = "order.paid";

/// One accepted webhook
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookRecord {
    pub id: Uuid,
    pub webhook_id: String,
    pub order_id: String,
    pub event_type: String,
    pub customer_email: Option<String>,
    pub raw_payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

/// Webhook about to be claimed
#[derive(Debug, Clone)]
pub struct NewWebhookRecord {
    pub webhook_id: String,
    pub order_id: String,
    pub event_type: String,
    pub customer_email: Option<String>,
    pub raw_payload: Value,
}

impl NewWebhookRecord {
    pub fn order_paid(
        webhook_id: impl Into<String>,
        order_id: impl Into<String>,
        customer_email: Option<String>,
        raw_payload: Value,
    ) -> Self {
        Self {
            webhook_id: webhook_id.into(),
            order_id: order_id.into(),
            event_type: ORDER_PAID_EVENT.to_string(),
            customer_email,
            raw_payload,
        }
    }
}

/// Local projection of a customer and their Moodle account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Identity {
    pub email: String,
    pub full_name: String,
    pub moodle_user_id: Option<i64>,
    pub medusa_order_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub moodle_processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyDecision {
    NewWebhook,
    DuplicateWebhook,
    DuplicateOrder,
    /// The customer already has a Moodle account; the order should be linked to it.
    UserExists(Identity),
}

impl IdempotencyDecision {
    pub fn can_process(&self) -> bool {
        matches!(self, IdempotencyDecision::NewWebhook)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            IdempotencyDecision::NewWebhook => "new_webhook",
            IdempotencyDecision::DuplicateWebhook => "duplicate_webhook",
            IdempotencyDecision::DuplicateOrder => "duplicate_order",
            IdempotencyDecision::UserExists(_) => "user_exists",
        }
    }

    /// Rejections are [`ErrorKind::Duplicate`]; accepted webhooks carry no kind.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        (!self.can_process()).then_some(ErrorKind::Duplicate)
    }
}

#[async_trait]
pub trait WebhookLedger: Send + Sync {
    async fn find_by_webhook_id(&self, webhook_id: &str) -> EnrollmentResult<Option<WebhookRecord>>;

    /// Most recent record for `order_id` processed within `window`.
    async fn find_recent_by_order_id(
        &self,
        order_id: &str,
        window: Duration,
    ) -> EnrollmentResult<Option<WebhookRecord>>;

    /// Insert `record` unless any record already exists for its webhook id or
    /// order id. Returns `true` only for the caller that inserted.
    async fn claim(&self, record: &NewWebhookRecord) -> EnrollmentResult<bool>;

    /// Remove a claim whose follow-up work could not be queued, so the next
    /// delivery of the same webhook is accepted. Returns `true` if a record was removed.
    async fn release(&self, webhook_id: &str) -> EnrollmentResult<bool>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> EnrollmentResult<Option<Identity>>;

    /// Identity for `email` only when it already carries a Moodle user id.
    async fn find_provisioned_by_email(&self, email: &str) -> EnrollmentResult<Option<Identity>> {
        Ok(self
            .find_by_email(email)
            .await?
            .filter(|identity| identity.moodle_user_id.is_some()))
    }

    /// Create or refresh the identity after a Moodle account was resolved.
    async fn upsert(
        &self,
        email: &str,
        full_name: &str,
        moodle_user_id: i64,
        order_id: &str,
    ) -> EnrollmentResult<Identity>;

    /// Point an existing identity at a new order, keeping its first processing time.
    async fn link_order(&self, email: &str, order_id: &str) -> EnrollmentResult<Identity>;
}

pub struct IdempotencyService {
    ledger: Arc<dyn WebhookLedger>,
    identities: Arc<dyn IdentityStore>,
    duplicate_order_window: Duration,
}

impl IdempotencyService {
    pub fn new(ledger: Arc<dyn WebhookLedger>, identities: Arc<dyn IdentityStore>) -> Self {
        Self {
            ledger,
            identities,
            duplicate_order_window: DUPLICATE_ORDER_WINDOW,
        }
    }

    pub fn identities(&self) -> &Arc<dyn IdentityStore> {
        &self.identities
    }

    pub async fn can_process(
        &self,
        webhook_id: &str,
        order_id: &str,
        customer_email: &str,
    ) -> EnrollmentResult<IdempotencyDecision> {
        if webhook_id.is_empty() {
            return Err(EnrollmentError::InvalidInput(
                "webhook id must not be empty".to_string(),
            ));
        }

        if let Some(existing) = self.ledger.find_by_webhook_id(webhook_id).await? {
            tracing::info!(
                webhook_id,
                order_id = %existing.order_id,
                processed_at = %existing.processed_at,
                "Duplicate webhook detected"
            );
            return Ok(IdempotencyDecision::DuplicateWebhook);
        }

        if let Some(existing) = self
            .ledger
            .find_recent_by_order_id(order_id, self.duplicate_order_window)
            .await?
        {
            tracing::info!(
                order_id,
                webhook_id,
                previous_webhook_id = %existing.webhook_id,
                "Duplicate order detected"
            );
            return Ok(IdempotencyDecision::DuplicateOrder);
        }

        if let Some(identity) = self
            .identities
            .find_provisioned_by_email(customer_email)
            .await?
        {
            tracing::info!(
                email = customer_email,
                moodle_user_id = ?identity.moodle_user_id,
                order_id,
                "Customer already has a Moodle account"
            );
            return Ok(IdempotencyDecision::UserExists(identity));
        }

        Ok(IdempotencyDecision::NewWebhook)
    }

    /// Atomically record the webhook. `false` means another delivery won.
    pub async fn claim(&self, record: &NewWebhookRecord) -> EnrollmentResult<bool> {
        let claimed = self.ledger.claim(record).await?;
        if claimed {
            tracing::info!(
                webhook_id = %record.webhook_id,
                order_id = %record.order_id,
                "Webhook claimed for processing"
            );
        } else {
            tracing::info!(
                webhook_id = %record.webhook_id,
                order_id = %record.order_id,
                "Webhook already claimed by another delivery"
            );
        }
        Ok(claimed)
    }

    /// Undo a claim whose job could not be queued.
    pub async fn release(&self, webhook_id: &str) -> EnrollmentResult<bool> {
        let released = self.ledger.release(webhook_id).await?;
        if released {
            tracing::warn!(webhook_id, "Webhook claim released for redelivery");
        }
        Ok(released)
    }

    pub async fn link_existing_identity(
        &self,
        identity: &Identity,
        order_id: &str,
    ) -> EnrollmentResult<Identity> {
        let linked = self.identities.link_order(&identity.email, order_id).await?;
        tracing::info!(
            email = %linked.email,
            moodle_user_id = ?linked.moodle_user_id,
            order_id,
            "Order linked to existing Moodle user"
        );
        Ok(linked)
    }
}

// =============================================================================
// PostgreSQL
// =============================================================================

pub struct PgWebhookLedger {
    pool: PgPool,
}

impl PgWebhookLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookLedger for PgWebhookLedger {
    async fn find_by_webhook_id(&self, webhook_id: &str) -> EnrollmentResult<Option<WebhookRecord>> {
        sqlx::query_as::<_, WebhookRecord>("SELECT * FROM webhook_ledger WHERE webhook_id = $1")
            .bind(webhook_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EnrollmentError::Database(e.to_string()))
    }

    async fn find_recent_by_order_id(
        &self,
        order_id: &str,
        window: Duration,
    ) -> EnrollmentResult<Option<WebhookRecord>> {
        sqlx::query_as::<_, WebhookRecord>(
            r#"
            SELECT * FROM webhook_ledger
            WHERE order_id = $1
              AND processed_at > NOW() - make_interval(secs => $2)
            ORDER BY processed_at DESC
            LIMIT 1
            "#,
        )
        .bind(order_id)
        .bind(window.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))
    }

    async fn claim(&self, record: &NewWebhookRecord) -> EnrollmentResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EnrollmentError::Database(e.to_string()))?;

        // Serialize claims for the same order; the unique index covers webhook ids.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&record.order_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| EnrollmentError::Database(e.to_string()))?;

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM webhook_ledger WHERE webhook_id = $1 OR order_id = $2)",
        )
        .bind(&record.webhook_id)
        .bind(&record.order_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))?;

        if exists {
            tx.rollback()
                .await
                .map_err(|e| EnrollmentError::Database(e.to_string()))?;
            return Ok(false);
        }

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_ledger (webhook_id, order_id, event_type, customer_email, raw_payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (webhook_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&record.webhook_id)
        .bind(&record.order_id)
        .bind(&record.event_type)
        .bind(&record.customer_email)
        .bind(&record.raw_payload)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| EnrollmentError::Database(e.to_string()))?;

        Ok(inserted.is_some())
    }

    async fn release(&self, webhook_id: &str) -> EnrollmentResult<bool> {
        let result = sqlx::query("DELETE FROM webhook_ledger WHERE webhook_id = $1")
            .bind(webhook_id)
            .execute(&self.pool)
            .await
            .map_err(|e| EnrollmentError::Database(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_by_email(&self, email: &str) -> EnrollmentResult<Option<Identity>> {
        sqlx::query_as::<_, Identity>("SELECT * FROM identities WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EnrollmentError::Database(e.to_string()))
    }

    async fn upsert(
        &self,
        email: &str,
        full_name: &str,
        moodle_user_id: i64,
        order_id: &str,
    ) -> EnrollmentResult<Identity> {
        sqlx::query_as::<_, Identity>(
            r#"
            INSERT INTO identities (email, full_name, moodle_user_id, medusa_order_id, moodle_processed_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (email) DO UPDATE SET
                full_name = EXCLUDED.full_name,
                moodle_user_id = EXCLUDED.moodle_user_id,
                medusa_order_id = EXCLUDED.medusa_order_id,
                moodle_processed_at = NOW(),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(full_name)
        .bind(moodle_user_id)
        .bind(order_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))
    }

    async fn link_order(&self, email: &str, order_id: &str) -> EnrollmentResult<Identity> {
        sqlx::query_as::<_, Identity>(
            r#"
            UPDATE identities
            SET medusa_order_id = $2,
                moodle_processed_at = COALESCE(moodle_processed_at, NOW()),
                updated_at = NOW()
            WHERE email = $1
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EnrollmentError::Database(e.to_string()))?
        .ok_or_else(|| EnrollmentError::NotFound(format!("identity {email}")))
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local ledger. The whole claim runs under one lock.
#[derive(Default)]
pub struct InMemoryWebhookLedger {
    records: Mutex<Vec<WebhookRecord>>,
}

impl InMemoryWebhookLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as if it had been processed at `processed_at`.
    pub async fn insert_processed_at(&self, record: &NewWebhookRecord, processed_at: OffsetDateTime) {
        let mut records = self.records.lock().await;
        records.push(to_record(record, processed_at));
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn to_record(record: &NewWebhookRecord, processed_at: OffsetDateTime) -> WebhookRecord {
    WebhookRecord {
        id: Uuid::new_v4(),
        webhook_id: record.webhook_id.clone(),
        order_id: record.order_id.clone(),
        event_type: record.event_type.clone(),
        customer_email: record.customer_email.clone(),
        raw_payload: record.raw_payload.clone(),
        processed_at,
    }
}

#[async_trait]
impl WebhookLedger for InMemoryWebhookLedger {
    async fn find_by_webhook_id(&self, webhook_id: &str) -> EnrollmentResult<Option<WebhookRecord>> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.webhook_id == webhook_id).cloned())
    }

    async fn find_recent_by_order_id(
        &self,
        order_id: &str,
        window: Duration,
    ) -> EnrollmentResult<Option<WebhookRecord>> {
        let cutoff = OffsetDateTime::now_utc() - window;
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.order_id == order_id && r.processed_at > cutoff)
            .max_by_key(|r| r.processed_at)
            .cloned())
    }

    async fn claim(&self, record: &NewWebhookRecord) -> EnrollmentResult<bool> {
        let mut records = self.records.lock().await;
        if records
            .iter()
            .any(|r| r.webhook_id == record.webhook_id || r.order_id == record.order_id)
        {
            return Ok(false);
        }
        records.push(to_record(record, OffsetDateTime::now_utc()));
        Ok(true)
    }

    async fn release(&self, webhook_id: &str) -> EnrollmentResult<bool> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.webhook_id != webhook_id);
        Ok(records.len() < before)
    }
}

#[derive(Default)]
pub struct InMemoryIdentityStore {
    identities: Mutex<HashMap<String, Identity>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_by_email(&self, email: &str) -> EnrollmentResult<Option<Identity>> {
        Ok(self.identities.lock().await.get(email).cloned())
    }

    async fn upsert(
        &self,
        email: &str,
        full_name: &str,
        moodle_user_id: i64,
        order_id: &str,
    ) -> EnrollmentResult<Identity> {
        let now = OffsetDateTime::now_utc();
        let mut identities = self.identities.lock().await;
        let identity = identities
            .entry(email.to_string())
            .or_insert_with(|| Identity {
                email: email.to_string(),
                full_name: String::new(),
                moodle_user_id: None,
                medusa_order_id: None,
                moodle_processed_at: None,
                created_at: now,
                updated_at: now,
            });
        identity.full_name = full_name.to_string();
        identity.moodle_user_id = Some(moodle_user_id);
        identity.medusa_order_id = Some(order_id.to_string());
        identity.moodle_processed_at = Some(now);
        identity.updated_at = now;
        Ok(identity.clone())
    }

    async fn link_order(&self, email: &str, order_id: &str) -> EnrollmentResult<Identity> {
        let now = OffsetDateTime::now_utc();
        let mut identities = self.identities.lock().await;
        let identity = identities
            .get_mut(email)
            .ok_or_else(|| EnrollmentError::NotFound(format!("identity {email}")))?;
        identity.medusa_order_id = Some(order_id.to_string());
        identity.moodle_processed_at.get_or_insert(now);
        identity.updated_at = now;
        Ok(identity.clone())
    }
}
