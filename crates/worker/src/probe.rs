//! Moodle connectivity check run at worker startup

use std::time::Duration;

use coursebridge_enrollment::{ErrorKind, MoodleApi, MoodleError, REQUIRED_FUNCTIONS};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub site_name: String,
    pub release: String,
    /// Required web service functions the token cannot call.
    pub missing_functions: Vec<&'static str>,
}

impl ProbeReport {
    pub fn is_ready(&self) -> bool {
        self.missing_functions.is_empty()
    }
}

/// 500ms, 1s, 2s, 4s, 8s with jitter.
pub fn startup_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(Duration::from_secs(30))
        .map(jitter)
        .take(5)
}

/// Fetch site info, retrying transient failures on `strategy`. Authorization
/// and validation failures are returned immediately.
pub async fn probe_moodle<S>(api: &dyn MoodleApi, strategy: S) -> Result<ProbeReport, MoodleError>
where
    S: IntoIterator<Item = Duration>,
{
    let info = RetryIf::start(
        strategy,
        || api.get_site_info(),
        |e: &MoodleError| e.kind() != ErrorKind::Permanent,
    )
    .await?;

    let missing_functions = REQUIRED_FUNCTIONS
        .iter()
        .copied()
        .filter(|function| !info.can_call(function))
        .collect();

    Ok(ProbeReport {
        site_name: info.sitename,
        release: info.release,
        missing_functions,
    })
}
