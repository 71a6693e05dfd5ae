//! Speed test provider boundary.
//!
//! The core never talks to a provider directly; it goes through these two
//! traits so the selection and scheduling logic can be exercised with fakes.

use std::time::Duration;

use async_trait::async_trait;

use super::{Endpoint, EndpointId, SpeedTestResult, TrialError};

pub mod ookla;

/// Runs one throughput/latency trial.
#[async_trait]
pub trait MeasurementPort: Send + Sync {
    /// Measure against `endpoint`, or let the provider pick when `None`.
    async fn run_trial(&self, endpoint: Option<EndpointId>) -> Result<SpeedTestResult, TrialError>;
}

/// Lists candidate endpoints for discovery.
#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    /// Candidates ordered by provider-reported proximity. May return fewer than `limit`.
    async fn list_candidates(&self, limit: usize) -> Result<Vec<Endpoint>, TrialError>;
}

/// Run one trial, treating a provider that does not answer within `timeout`
/// as a failed trial rather than waiting forever.
pub async fn run_trial_bounded(
    port: &dyn MeasurementPort,
    endpoint: Option<EndpointId>,
    timeout: Duration,
) -> Result<SpeedTestResult, TrialError> {
    match tokio::time::timeout(timeout, port.run_trial(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(TrialError::TimedOut {
            secs: timeout.as_secs(),
        }),
    }
}
