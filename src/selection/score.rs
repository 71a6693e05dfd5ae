//! Endpoint scoring and ranking.
//!
//! `score = download_mbps - ping_ms / 10`, ordered descending, ties broken by
//! lower ping and then lower endpoint id.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::throughput::{EndpointId, TrialResult};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScoreError {
    #[error("malformed trial for endpoint {endpoint_id}: {reason}")]
    MalformedTrial {
        endpoint_id: EndpointId,
        reason: String,
    },
}

/// One ranked endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEndpoint {
    pub endpoint_id: EndpointId,
    pub score: f64,
    pub download_mbps: f64,
    pub ping_ms: f64,
}

/// Result of ranking a batch of trials.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    /// Best first.
    pub ranked: Vec<ScoredEndpoint>,
    /// Trials excluded from the ranking.
    pub rejected: Vec<ScoreError>,
}

impl Ranking {
    pub fn best(&self) -> Option<&ScoredEndpoint> {
        self.ranked.first()
    }
}

pub fn compute_score(download_mbps: f64, ping_ms: f64) -> f64 {
    download_mbps - ping_ms / 10.0
}

fn validate(trial: &TrialResult) -> Result<ScoredEndpoint, ScoreError> {
    let malformed = |reason: &str| ScoreError::MalformedTrial {
        endpoint_id: trial.endpoint_id,
        reason: reason.to_string(),
    };

    let download = trial.download_mbps.ok_or_else(|| malformed("missing download"))?;
    if !download.is_finite() || download < 0.0 {
        return Err(malformed("download must be a non-negative number"));
    }
    let ping = trial.ping_ms.ok_or_else(|| malformed("missing ping"))?;
    if !ping.is_finite() || ping < 0.0 {
        return Err(malformed("ping must be a non-negative number"));
    }

    Ok(ScoredEndpoint {
        endpoint_id: trial.endpoint_id,
        score: compute_score(download, ping),
        download_mbps: download,
        ping_ms: ping,
    })
}

fn compare(a: &ScoredEndpoint, b: &ScoredEndpoint) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.ping_ms.total_cmp(&b.ping_ms))
        .then_with(|| a.endpoint_id.cmp(&b.endpoint_id))
}

/// Rank trials best first. Malformed trials are reported in `rejected` and
/// do not affect the rest of the batch.
pub fn rank(results: &[TrialResult]) -> Ranking {
    let mut ranking = Ranking::default();
    for trial in results {
        match validate(trial) {
            Ok(scored) => ranking.ranked.push(scored),
            Err(e) => {
                tracing::warn!(endpoint = %trial.endpoint_id, error = %e, "trial excluded from ranking");
                ranking.rejected.push(e);
            }
        }
    }
    ranking.ranked.sort_by(compare);
    ranking
}
