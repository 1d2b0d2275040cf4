//! Per-order enrollment state machine
//!
//! ```text
//! received -> user_creating -> user_created -> enrolling -> enrolled
//!                                                        \-> enrollment_failed -> enrolling (sweep)
//! ```
//!
//! The current state is kept in the key-value store for observability only.
//! Job retries re-enter `user_creating` and `enrolling`; a redelivered webhook
//! whose claim was released re-enters `received`.

use std::sync::Arc;
use std::time::Duration;

use coursebridge_shared::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{EnrollmentError, EnrollmentResult};

pub const WORKFLOW_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const KEY_PREFIX: &str = "workflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    Received,
    UserCreating,
    UserCreated,
    Enrolling,
    Enrolled,
    EnrollmentFailed,
}

impl EnrollmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentState::Received => "received",
            EnrollmentState::UserCreating => "user_creating",
            EnrollmentState::UserCreated => "user_created",
            EnrollmentState::Enrolling => "enrolling",
            EnrollmentState::Enrolled => "enrolled",
            EnrollmentState::EnrollmentFailed => "enrollment_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrollmentState::Enrolled | EnrollmentState::EnrollmentFailed
        )
    }

    pub fn can_transition_to(&self, next: EnrollmentState) -> bool {
        use EnrollmentState::*;
        matches!(
            (self, next),
            (Received, Received)
                | (Received, UserCreating)
                | (UserCreating, UserCreating)
                | (UserCreating, UserCreated)
                | (UserCreated, Enrolling)
                | (Enrolling, Enrolling)
                | (Enrolling, Enrolled)
                | (Enrolling, EnrollmentFailed)
                | (EnrollmentFailed, Enrolling)
                | (EnrollmentFailed, Enrolled)
        )
    }
}

impl std::fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub state: EnrollmentState,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct WorkflowTracker {
    store: Arc<dyn KeyValueStore>,
}

impl WorkflowTracker {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(order_id: &str) -> String {
        format!("{KEY_PREFIX}:{order_id}")
    }

    pub async fn current(&self, order_id: &str) -> EnrollmentResult<Option<WorkflowRecord>> {
        match self.store.get(&Self::key(order_id)).await? {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                EnrollmentError::Store(StoreError::InvalidValue(format!(
                    "workflow state for {order_id}: {e}"
                )))
            }),
            None => Ok(None),
        }
    }

    /// Move the order to `next`. Orders without a recorded state accept any
    /// state, since the record may have expired.
    pub async fn advance(
        &self,
        order_id: &str,
        next: EnrollmentState,
        detail: Option<&str>,
    ) -> EnrollmentResult<EnrollmentState> {
        if let Some(current) = self.current(order_id).await? {
            if !current.state.can_transition_to(next) {
                return Err(EnrollmentError::InvalidTransition {
                    order_id: order_id.to_string(),
                    from: current.state.to_string(),
                    to: next.to_string(),
                });
            }
        }

        let record = WorkflowRecord {
            state: next,
            updated_at: OffsetDateTime::now_utc(),
            detail: detail.map(str::to_string),
        };
        let raw = serde_json::to_string(&record)?;
        self.store
            .set(&Self::key(order_id), &raw, Some(WORKFLOW_TTL))
            .await?;

        tracing::debug!(order_id, state = %next, "Workflow state advanced");
        Ok(next)
    }
}
