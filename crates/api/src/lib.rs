// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! CourseBridge API Library
//!
//! HTTP intake for Medusa `order.paid` webhooks. Requests are verified,
//! validated and handed to the enrollment core; the Moodle work itself runs
//! in the worker.

pub mod config;
pub mod error;
pub mod routes;
pub mod security;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
