//! Speed test domain types: endpoints, trials, and provider failures.

pub mod provider;
pub mod report;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure outcomes a speed test provider can report for one trial.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrialError {
    #[error("endpoint {endpoint} unavailable: {reason}")]
    EndpointUnavailable { endpoint: String, reason: String },

    #[error("provider rate limit hit: {reason}")]
    ProviderRateLimited { reason: String },

    #[error("network unreachable: {reason}")]
    NetworkUnreachable { reason: String },

    #[error("malformed provider output: {reason}")]
    Malformed { reason: String },

    #[error("trial did not complete within {secs}s")]
    TimedOut { secs: u64 },

    #[error("could not launch provider: {reason}")]
    Launch { reason: String },
}

impl TrialError {
    /// Short stable label used in logs and stored outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            TrialError::EndpointUnavailable { .. } => "endpoint_unavailable",
            TrialError::ProviderRateLimited { .. } => "rate_limited",
            TrialError::NetworkUnreachable { .. } => "network_unreachable",
            TrialError::Malformed { .. } => "malformed",
            TrialError::TimedOut { .. } => "timed_out",
            TrialError::Launch { .. } => "launch_failed",
        }
    }
}

/// Error returned when an endpoint id cannot be parsed.
#[derive(Debug, Error, PartialEq)]
#[error("invalid endpoint id '{0}': expected a positive integer")]
pub struct InvalidEndpointId(pub String);

/// Stable identifier of a speed test server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub u32);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for EndpointId {
    type Err = InvalidEndpointId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u32>() {
            Ok(id) if id > 0 => Ok(EndpointId(id)),
            _ => Err(InvalidEndpointId(s.to_string())),
        }
    }
}

/// A remote measurement target.
///
/// Providers do not always report location or distance, so those stay optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub location: Option<String>,
    pub country: Option<String>,
    pub distance_km: Option<f64>,
}

impl Endpoint {
    /// "City, Country" when both are known, whichever is known otherwise.
    pub fn display_location(&self) -> Option<String> {
        match (&self.location, &self.country) {
            (Some(l), Some(c)) => Some(format!("{}, {}", l, c)),
            (Some(l), None) => Some(l.clone()),
            (None, Some(c)) => Some(c.clone()),
            (None, None) => None,
        }
    }
}

/// Outcome of one measurement against one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub endpoint_id: EndpointId,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub ping_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Full result of a provider run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedTestResult {
    pub trial: TrialResult,
    pub endpoint: Endpoint,
    pub isp: Option<String>,
    pub external_ip: Option<String>,
    pub packet_loss_pct: Option<f64>,
    pub result_url: Option<String>,
    pub detail: TransferDetail,
}

/// Latency observed while a transfer saturates the link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadedLatency {
    pub iqm_ms: Option<f64>,
    pub low_ms: Option<f64>,
    pub high_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

/// Figures beyond the headline throughput and idle ping. All optional:
/// older CLI builds omit them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferDetail {
    pub ping_low_ms: Option<f64>,
    pub ping_high_ms: Option<f64>,
    pub download_latency: LoadedLatency,
    pub upload_latency: LoadedLatency,
    pub download_bytes: Option<u64>,
    pub upload_bytes: Option<u64>,
}

/// Convert a provider bandwidth figure (bytes per second) to Mbps.
pub fn bytes_per_sec_to_mbps(bandwidth: f64) -> f64 {
    bandwidth * 8.0 / 1_000_000.0
}
