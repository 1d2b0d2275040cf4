//! HTTP routes

pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/medusa/order-paid", post(webhooks::order_paid))
        .route("/webhooks/medusa/health", get(webhooks::health))
        .with_state(state)
}
