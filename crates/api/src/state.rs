//! Application state

use std::sync::Arc;

use coursebridge_enrollment::IntakeService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub intake: Arc<IntakeService>,
}

impl AppState {
    pub fn new(config: Config, intake: IntakeService) -> Self {
        Self {
            config,
            intake: Arc::new(intake),
        }
    }

    pub fn webhook_secret(&self) -> &str {
        &self.config.webhook_secret
    }
}
