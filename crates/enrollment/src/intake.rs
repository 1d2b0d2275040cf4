//! Medusa `order.paid` intake
//!
//! Turns a raw webhook body into an [`OrderPaid`], runs the idempotency checks
//! and queues the user creation job. Medusa does not use a stable field name
//! for the order id across event types, so the id is derived by trying each
//! [`OrderIdStrategy`] in order.

use std::sync::Arc;
use std::time::Duration;

use coursebridge_shared::KeyValueStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EnrollmentError, EnrollmentResult};
use crate::idempotency::{
    IdempotencyDecision, IdempotencyService, IdentityStore, NewWebhookRecord, PgIdentityStore,
    PgWebhookLedger, WebhookLedger,
};
use crate::queue::{EnrollmentJob, JobQueue, PgJobQueue};
use crate::workflow::{EnrollmentState, WorkflowTracker};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub course_id: Option<i64>,
}

/// Validated `order.paid` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaid {
    pub order_id: String,
    pub webhook_id: String,
    pub customer_email: String,
    pub customer_first_name: String,
    pub customer_last_name: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub line_items: Vec<LineItem>,
}

impl OrderPaid {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.customer_first_name, self.customer_last_name)
            .trim()
            .to_string()
    }

    /// Distinct course ids in line item order, or the default course when no
    /// item names one.
    pub fn course_ids(&self, default_course_id: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = Vec::new();
        for id in self.line_items.iter().filter_map(|item| item.course_id) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            ids.push(default_course_id);
        }
        ids
    }
}

/// Where an order id was found, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderIdStrategy {
    /// `id` on the payload root
    RootId,
    /// `order_id` on the payload root
    OrderIdField,
    /// `metadata.order_id` or `metadata.medusa_order_id`
    MetadataOrderId,
    /// `{customer_id}_{unix timestamp}`
    CustomerTimestamp,
    /// `item_{id}` of the first line item
    FirstLineItem,
    /// `order_{uuid}`
    Generated,
}

impl OrderIdStrategy {
    pub const ALL: [OrderIdStrategy; 6] = [
        OrderIdStrategy::RootId,
        OrderIdStrategy::OrderIdField,
        OrderIdStrategy::MetadataOrderId,
        OrderIdStrategy::CustomerTimestamp,
        OrderIdStrategy::FirstLineItem,
        OrderIdStrategy::Generated,
    ];

    pub fn extract(&self, payload: &Value) -> Option<String> {
        match self {
            OrderIdStrategy::RootId => text(payload.get("id")),
            OrderIdStrategy::OrderIdField => text(payload.get("order_id")),
            OrderIdStrategy::MetadataOrderId => {
                let metadata = payload.get("metadata")?;
                text(metadata.get("order_id")).or_else(|| text(metadata.get("medusa_order_id")))
            }
            OrderIdStrategy::CustomerTimestamp => {
                let customer_id = text(payload.get("customer_id"))
                    .or_else(|| text(payload.pointer("/customer/id")))?;
                Some(format!(
                    "{}_{}",
                    customer_id,
                    OffsetDateTime::now_utc().unix_timestamp()
                ))
            }
            OrderIdStrategy::FirstLineItem => {
                text(payload.pointer("/items/0/id")).map(|id| format!("item_{id}"))
            }
            OrderIdStrategy::Generated => Some(format!("order_{}", Uuid::new_v4().simple())),
        }
    }
}

/// Non-empty string or number at `value`.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn course_id(metadata: Option<&Value>) -> Option<i64> {
    let metadata = metadata?;
    ["moodle_course_id", "course_id"].iter().find_map(|key| {
        let id = match metadata.get(*key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        id.filter(|id| *id > 0)
    })
}

pub fn derive_order_id(payload: &Value) -> (String, OrderIdStrategy) {
    for strategy in OrderIdStrategy::ALL {
        if let Some(id) = strategy.extract(payload) {
            return (id, strategy);
        }
    }
    // Generated always yields an id
    (
        format!("order_{}", Uuid::new_v4().simple()),
        OrderIdStrategy::Generated,
    )
}

/// `X-Webhook-Id` header, else the payload id, else a fresh `wh_` token.
pub fn resolve_webhook_id(header: Option<&str>, payload: &Value) -> String {
    header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| text(payload.get("id")))
        .unwrap_or_else(|| format!("wh_{}", Uuid::new_v4().simple()))
}

pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}

/// Validate the payload shape and build the event.
pub fn parse_order_paid(payload: &Value, webhook_id_header: Option<&str>) -> EnrollmentResult<OrderPaid> {
    let mut problems = Vec::new();

    let email = text(payload.pointer("/customer/email")).map(|e| e.to_lowercase());
    match &email {
        None => problems.push("customer.email is required"),
        Some(e) if !is_valid_email(e) => problems.push("customer.email must be a valid email address"),
        Some(_) => {}
    }

    let first_name = text(payload.pointer("/customer/first_name"));
    if first_name.is_none() {
        problems.push("customer.first_name is required");
    }
    let last_name = text(payload.pointer("/customer/last_name"));
    if last_name.is_none() {
        problems.push("customer.last_name is required");
    }

    let items = payload
        .get("items")
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty());
    if items.is_none() {
        problems.push("items must contain at least one item");
    }

    if !problems.is_empty() {
        return Err(EnrollmentError::InvalidInput(problems.join("; ")));
    }

    let line_items = items
        .map(|items| {
            items
                .iter()
                .enumerate()
                .map(|(index, item)| LineItem {
                    id: text(item.get("id")).unwrap_or_else(|| format!("item_{index}")),
                    course_id: course_id(item.get("metadata")),
                })
                .collect()
        })
        .unwrap_or_default();

    let (order_id, strategy) = derive_order_id(payload);
    if !matches!(strategy, OrderIdStrategy::RootId | OrderIdStrategy::OrderIdField) {
        tracing::warn!(order_id = %order_id, strategy = ?strategy, "Order id derived from fallback field");
    }

    Ok(OrderPaid {
        order_id,
        webhook_id: resolve_webhook_id(webhook_id_header, payload),
        customer_email: email.unwrap_or_default(),
        customer_first_name: first_name.unwrap_or_default(),
        customer_last_name: last_name.unwrap_or_default(),
        customer_id: text(payload.pointer("/customer/id")).or_else(|| text(payload.get("customer_id"))),
        line_items,
    })
}

/// What intake did with a webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntakeOutcome {
    Queued {
        order_id: String,
        webhook_id: String,
        job_id: Uuid,
    },
    Duplicate {
        order_id: String,
        webhook_id: String,
        reason: &'static str,
    },
    /// The customer already has a Moodle account; the order was attached to it.
    Linked {
        order_id: String,
        moodle_user_id: Option<i64>,
    },
}

pub struct IntakeService {
    idempotency: Arc<IdempotencyService>,
    queue: Arc<dyn JobQueue>,
    workflow: WorkflowTracker,
}

impl IntakeService {
    pub fn new(
        idempotency: Arc<IdempotencyService>,
        queue: Arc<dyn JobQueue>,
        workflow: WorkflowTracker,
    ) -> Self {
        Self {
            idempotency,
            queue,
            workflow,
        }
    }

    /// Intake backed by Postgres. Needs no Moodle settings; only the worker
    /// talks to Moodle.
    pub fn from_pool(pool: PgPool, store: Arc<dyn KeyValueStore>) -> Self {
        Self::from_parts(
            Arc::new(PgWebhookLedger::new(pool.clone())),
            Arc::new(PgIdentityStore::new(pool.clone())),
            Arc::new(PgJobQueue::new(pool)),
            store,
        )
    }

    pub fn from_parts(
        ledger: Arc<dyn WebhookLedger>,
        identities: Arc<dyn IdentityStore>,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::new(
            Arc::new(IdempotencyService::new(ledger, identities)),
            queue,
            WorkflowTracker::new(store),
        )
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub async fn handle_order_paid(
        &self,
        order: &OrderPaid,
        raw_payload: &Value,
    ) -> EnrollmentResult<IntakeOutcome> {
        tracing::info!(
            order_id = %order.order_id,
            webhook_id = %order.webhook_id,
            items = order.line_items.len(),
            "Processing order.paid webhook"
        );

        let decision = self
            .idempotency
            .can_process(&order.webhook_id, &order.order_id, &order.customer_email)
            .await?;

        match decision {
            IdempotencyDecision::NewWebhook => {}
            IdempotencyDecision::UserExists(identity) => {
                let linked = self
                    .idempotency
                    .link_existing_identity(&identity, &order.order_id)
                    .await?;
                return Ok(IntakeOutcome::Linked {
                    order_id: order.order_id.clone(),
                    moodle_user_id: linked.moodle_user_id,
                });
            }
            rejected => {
                return Ok(IntakeOutcome::Duplicate {
                    order_id: order.order_id.clone(),
                    webhook_id: order.webhook_id.clone(),
                    reason: rejected.reason(),
                });
            }
        }

        let record = NewWebhookRecord::order_paid(
            &order.webhook_id,
            &order.order_id,
            Some(order.customer_email.clone()),
            raw_payload.clone(),
        );
        if !self.idempotency.claim(&record).await? {
            return Ok(IntakeOutcome::Duplicate {
                order_id: order.order_id.clone(),
                webhook_id: order.webhook_id.clone(),
                reason: IdempotencyDecision::DuplicateWebhook.reason(),
            });
        }

        self.transition(&order.order_id, EnrollmentState::Received).await;

        let job = EnrollmentJob::CreateMoodleUser {
            order: order.clone(),
        };
        let job_id = match self.queue.enqueue(&job, Duration::ZERO).await {
            Ok(job_id) => job_id,
            Err(e) => {
                tracing::error!(
                    order_id = %order.order_id,
                    webhook_id = %order.webhook_id,
                    error = %e,
                    "User creation job could not be queued, releasing claim"
                );
                // The sender retries on the error response; the claim must not block it.
                if let Err(release_err) = self.idempotency.release(&order.webhook_id).await {
                    tracing::error!(
                        order_id = %order.order_id,
                        webhook_id = %order.webhook_id,
                        error = %release_err,
                        "Claim could not be released; order needs operator attention"
                    );
                }
                return Err(e);
            }
        };

        self.transition(&order.order_id, EnrollmentState::UserCreating)
            .await;

        tracing::info!(
            order_id = %order.order_id,
            webhook_id = %order.webhook_id,
            job_id = %job_id,
            "User creation job queued"
        );

        Ok(IntakeOutcome::Queued {
            order_id: order.order_id.clone(),
            webhook_id: order.webhook_id.clone(),
            job_id,
        })
    }

    async fn transition(&self, order_id: &str, state: EnrollmentState) {
        if let Err(e) = self.workflow.advance(order_id, state, None).await {
            tracing::warn!(order_id, state = %state, error = %e, "Workflow state not updated");
        }
    }
}
