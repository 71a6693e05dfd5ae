//! Explicit multi-endpoint discovery ("find best server").
//!
//! Trials run one at a time in provider order; concurrent trials against the
//! same provider are what trigger its rate limiting.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use super::cache::{PreferenceCache, PreferenceRecord};
use super::score::{rank, Ranking};
use crate::throughput::provider::{run_trial_bounded, EndpointDirectory, MeasurementPort};
use crate::throughput::{Endpoint, EndpointId, TrialError};

pub const DEFAULT_CANDIDATES: usize = 5;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Maximum number of candidates to trial.
    pub limit: usize,
    /// Pause between consecutive trials.
    pub pause: Duration,
    /// Upper bound for a single trial.
    pub trial_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_CANDIDATES,
            pause: Duration::from_secs(2),
            trial_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("could not list candidate endpoints: {0}")]
    Listing(#[source] TrialError),

    #[error("provider returned no candidate endpoints")]
    NoCandidates,

    #[error("none of the {attempted} candidate trials produced a usable result")]
    NoUsableTrials { attempted: usize },

    #[error("failed to save preference: {0:#}")]
    Save(anyhow::Error),
}

/// What a discovery run found.
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub best: EndpointId,
    pub candidates: Vec<Endpoint>,
    pub ranking: Ranking,
    pub failures: Vec<(EndpointId, TrialError)>,
    pub record: PreferenceRecord,
}

impl DiscoveryOutcome {
    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.candidates.iter().find(|e| e.id == id)
    }
}

/// Trial up to `opts.limit` candidates, rank them, and overwrite the cache.
pub async fn discover(
    port: &dyn MeasurementPort,
    directory: &dyn EndpointDirectory,
    cache: &PreferenceCache,
    opts: &DiscoveryOptions,
) -> Result<DiscoveryOutcome, DiscoveryError> {
    info!(limit = opts.limit, "starting endpoint discovery");

    let mut candidates = directory
        .list_candidates(opts.limit)
        .await
        .map_err(DiscoveryError::Listing)?;
    candidates.truncate(opts.limit);
    if candidates.is_empty() {
        return Err(DiscoveryError::NoCandidates);
    }

    let mut trials = Vec::with_capacity(candidates.len());
    let mut failures = Vec::new();

    for (i, candidate) in candidates.iter().enumerate() {
        if i > 0 && !opts.pause.is_zero() {
            tokio::time::sleep(opts.pause).await;
        }
        info!(
            endpoint = %candidate.id,
            name = %candidate.name,
            n = i + 1,
            of = candidates.len(),
            "testing candidate"
        );
        match run_trial_bounded(port, Some(candidate.id), opts.trial_timeout).await {
            Ok(result) => {
                // The provider reports the endpoint it used; rank under the one we asked for.
                let mut trial = result.trial;
                trial.endpoint_id = candidate.id;
                trials.push(trial);
            }
            Err(e) => {
                warn!(endpoint = %candidate.id, kind = e.kind(), error = %e, "candidate trial failed");
                failures.push((candidate.id, e));
            }
        }
    }

    let ranking = rank(&trials);
    let record = PreferenceRecord::from_ranking(&ranking, Utc::now()).ok_or(
        DiscoveryError::NoUsableTrials {
            attempted: candidates.len(),
        },
    )?;

    for (pos, s) in ranking.ranked.iter().enumerate() {
        info!(
            rank = pos + 1,
            endpoint = %s.endpoint_id,
            score = s.score,
            download_mbps = s.download_mbps,
            ping_ms = s.ping_ms,
            "candidate ranked"
        );
    }

    cache.save(&record).map_err(DiscoveryError::Save)?;

    let best = ranking
        .best()
        .map(|s| s.endpoint_id)
        .ok_or(DiscoveryError::NoUsableTrials {
            attempted: candidates.len(),
        })?;
    info!(endpoint = %best, "best endpoint selected and cached");

    Ok(DiscoveryOutcome {
        best,
        candidates,
        ranking,
        failures,
        record,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throughput::{SpeedTestResult, TransferDetail, TrialResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeProvider {
        servers: Vec<Endpoint>,
        // endpoint -> (download, ping); missing means the trial fails
        figures: HashMap<u32, (f64, f64)>,
        calls: Mutex<Vec<Option<EndpointId>>>,
    }

    fn endpoint(id: u32) -> Endpoint {
        Endpoint {
            id: EndpointId(id),
            name: format!("server-{}", id),
            location: None,
            country: None,
            distance_km: None,
        }
    }

    impl FakeProvider {
        fn new(ids: &[u32], figures: &[(u32, f64, f64)]) -> Self {
            Self {
                servers: ids.iter().map(|id| endpoint(*id)).collect(),
                figures: figures.iter().map(|(id, d, p)| (*id, (*d, *p))).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MeasurementPort for FakeProvider {
        async fn run_trial(&self, ep: Option<EndpointId>) -> Result<SpeedTestResult, TrialError> {
            self.calls.lock().unwrap().push(ep);
            let id = ep.expect("discovery always names an endpoint");
            let (download, ping) = self.figures.get(&id.0).copied().ok_or_else(|| {
                TrialError::EndpointUnavailable {
                    endpoint: id.to_string(),
                    reason: "down".to_string(),
                }
            })?;
            Ok(SpeedTestResult {
                trial: TrialResult {
                    endpoint_id: id,
                    download_mbps: Some(download),
                    upload_mbps: Some(10.0),
                    ping_ms: Some(ping),
                    jitter_ms: None,
                    timestamp: Utc::now(),
                },
                endpoint: endpoint(id.0),
                isp: None,
                external_ip: None,
                packet_loss_pct: None,
                result_url: None,
                detail: TransferDetail::default(),
            })
        }
    }

    #[async_trait]
    impl EndpointDirectory for FakeProvider {
        async fn list_candidates(&self, limit: usize) -> Result<Vec<Endpoint>, TrialError> {
            Ok(self.servers.iter().take(limit).cloned().collect())
        }
    }

    fn quick() -> DiscoveryOptions {
        DiscoveryOptions {
            pause: Duration::ZERO,
            ..DiscoveryOptions::default()
        }
    }

    #[tokio::test]
    async fn test_discovery_ranks_and_caches_best() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = PreferenceCache::in_dir(dir.path());
        let provider = FakeProvider::new(
            &[1, 2, 3, 4, 5],
            &[
                (1, 100.0, 10.0),
                (2, 80.0, 10.0),
                (3, 60.0, 10.0),
                (4, 40.0, 10.0),
                (5, 20.0, 10.0),
            ],
        );

        let outcome = discover(&provider, &provider, &cache, &quick()).await.unwrap();
        assert_eq!(outcome.best, EndpointId(1));
        let order: Vec<u32> = outcome.ranking.ranked.iter().map(|s| s.endpoint_id.0).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
        let scores: Vec<f64> = outcome.ranking.ranked.iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![99.0, 79.0, 59.0, 39.0, 19.0]);

        let saved = cache.load().unwrap();
        assert_eq!(saved.best_endpoint_id, Some(EndpointId(1)));
        assert_eq!(saved.candidate_scores.len(), 5);
        assert_eq!(saved, outcome.record);
    }

    #[tokio::test]
    async fn test_discovery_respects_limit_and_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = PreferenceCache::in_dir(dir.path());
        let provider = FakeProvider::new(
            &[7, 3, 9, 1],
            &[(7, 10.0, 1.0), (3, 20.0, 1.0), (9, 30.0, 1.0), (1, 40.0, 1.0)],
        );
        let opts = DiscoveryOptions {
            limit: 2,
            ..quick()
        };
        let outcome = discover(&provider, &provider, &cache, &opts).await.unwrap();
        let calls = provider.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![Some(EndpointId(7)), Some(EndpointId(3))]);
        assert_eq!(outcome.best, EndpointId(3));
    }

    #[tokio::test]
    async fn test_failed_candidates_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = PreferenceCache::in_dir(dir.path());
        let provider = FakeProvider::new(&[1, 2, 3], &[(2, 50.0, 5.0)]);
        let outcome = discover(&provider, &provider, &cache, &quick()).await.unwrap();
        assert_eq!(outcome.best, EndpointId(2));
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(cache.load().unwrap().candidate_scores.len(), 1);
    }

    #[tokio::test]
    async fn test_all_failures_leave_cache_untouched() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = PreferenceCache::in_dir(dir.path());
        let provider = FakeProvider::new(&[1, 2], &[]);
        let err = discover(&provider, &provider, &cache, &quick())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NoUsableTrials { attempted: 2 }));
        assert!(cache.load().is_none());
    }

    #[tokio::test]
    async fn test_rediscovery_overwrites_previous_scores() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = PreferenceCache::in_dir(dir.path());
        let first = FakeProvider::new(&[1, 2], &[(1, 10.0, 1.0), (2, 20.0, 1.0)]);
        discover(&first, &first, &cache, &quick()).await.unwrap();

        let second = FakeProvider::new(&[3], &[(3, 5.0, 1.0)]);
        discover(&second, &second, &cache, &quick()).await.unwrap();

        let record = cache.load().unwrap();
        assert_eq!(record.best_endpoint_id, Some(EndpointId(3)));
        assert_eq!(record.candidate_scores.keys().copied().collect::<Vec<_>>(), vec![EndpointId(3)]);
    }

    #[tokio::test]
    async fn test_empty_candidate_list_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = PreferenceCache::in_dir(dir.path());
        let provider = FakeProvider::new(&[], &[]);
        let err = discover(&provider, &provider, &cache, &quick())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NoCandidates));
    }
}
