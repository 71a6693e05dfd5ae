use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::history::{CycleOutcome, RunStatus, RunSummary};
use crate::selection::{self, DiscoveryOptions, PreferenceCache, Selection, SelectionRequest};
use crate::storage::{MeasurementRecord, RecordSink};
use crate::throughput::provider::{run_trial_bounded, EndpointDirectory, MeasurementPort};
use crate::throughput::{EndpointId, TrialError};

/// Knobs the scheduler needs from configuration.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub trial_timeout: Duration,
    pub discovery: DiscoveryOptions,
    /// Consecutive cycles where the cached endpoint failed but the provider
    /// default worked, before invalidation; 0 disables.
    pub failure_threshold: u32,
    pub rediscover_after_invalidate: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            trial_timeout: Duration::from_secs(120),
            discovery: DiscoveryOptions::default(),
            failure_threshold: 3,
            rediscover_after_invalidate: false,
        }
    }
}

/// Delay before the next cycle so that cycle starts are `interval` apart.
/// An overrunning cycle is followed immediately.
pub fn next_delay(interval: Duration, cycle_elapsed: Duration) -> Duration {
    interval.saturating_sub(cycle_elapsed)
}

/// Drives measurement cycles, one at a time.
pub struct Scheduler {
    port: Arc<dyn MeasurementPort>,
    directory: Arc<dyn EndpointDirectory>,
    cache: PreferenceCache,
    sink: Arc<dyn RecordSink>,
    settings: SchedulerSettings,
    request: SelectionRequest,
    cycles: u64,
    cached_failures: Option<(EndpointId, u32)>,
    pending_discovery: bool,
}

impl Scheduler {
    pub fn new(
        port: Arc<dyn MeasurementPort>,
        directory: Arc<dyn EndpointDirectory>,
        cache: PreferenceCache,
        sink: Arc<dyn RecordSink>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            port,
            directory,
            cache,
            sink,
            settings,
            request: SelectionRequest::default(),
            cycles: 0,
            cached_failures: None,
            pending_discovery: false,
        }
    }

    pub fn with_request(mut self, request: SelectionRequest) -> Self {
        self.request = request;
        self
    }

    pub fn cache(&self) -> &PreferenceCache {
        &self.cache
    }

    /// Run one cycle. Discovery only happens if it was requested, either via
    /// [`Scheduler::request_discovery`] or the opt-in rediscovery setting.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let discover = std::mem::take(&mut self.pending_discovery);
        self.cycle(discover).await
    }

    /// Make the next cycle run discovery before measuring.
    pub fn request_discovery(&mut self) {
        self.pending_discovery = true;
    }

    /// Repeat cycles every `interval` until `cancel` fires or `max_cycles`
    /// have been attempted. Cycle failures never end the loop.
    pub async fn run_continuous(
        &mut self,
        interval: Duration,
        cancel: CancellationToken,
        max_cycles: Option<u64>,
    ) -> RunSummary {
        info!(interval_secs = interval.as_secs(), ?max_cycles, "continuous monitoring started");
        let mut summary = RunSummary::default();

        while !cancel.is_cancelled() {
            let started = tokio::time::Instant::now();
            let outcome = self.run_cycle().await;
            summary.record(&outcome);

            if max_cycles.is_some_and(|max| summary.attempted >= max) {
                break;
            }

            let delay = next_delay(interval, started.elapsed());
            if delay.is_zero() {
                warn!(
                    cycle = outcome.cycle,
                    "cycle took longer than the interval, starting next cycle now"
                );
                continue;
            }

            info!(wait_secs = delay.as_secs(), "waiting until next cycle");
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancellation received");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "continuous monitoring stopped"
        );
        summary
    }

    async fn cycle(&mut self, discover: bool) -> CycleOutcome {
        self.cycles += 1;
        let cycle = self.cycles;
        let started_at = Utc::now();

        if discover {
            self.discover_in_cycle(cycle).await;
        }

        let selection = selection::resolve(&self.request, &self.cache);
        info!(cycle, %selection, "starting measurement cycle");

        let mut failures = Vec::new();
        let (used, result) = match self.measure(selection).await {
            Ok(record) => {
                if let Selection::CachedPreferred(_) = selection {
                    self.cached_failures = None;
                }
                (selection, Ok(record))
            }
            Err(e) => {
                warn!(cycle, %selection, kind = e.kind(), error = %e, "measurement attempt failed");
                failures.push(e.clone());
                match selection.fallback() {
                    Some(fallback) => {
                        info!(cycle, from = %selection, to = %fallback, "retrying with fallback selection");
                        let retry = self.measure(fallback).await;
                        if let Selection::CachedPreferred(id) = selection {
                            // Only a working fallback shows the cached endpoint itself is at fault.
                            if retry.is_ok() && counts_against_endpoint(&e) {
                                self.note_cached_failure(id);
                            } else {
                                debug!(cycle, endpoint = %id, "failure not attributed to cached endpoint");
                            }
                        }
                        if let Err(e) = &retry {
                            failures.push(e.clone());
                        }
                        (fallback, retry)
                    }
                    None => (selection, Err(e)),
                }
            }
        };

        let (status, record, persisted) = match result {
            Ok(record) => {
                info!(
                    cycle,
                    endpoint = record.endpoint_id,
                    name = %record.endpoint_name,
                    download_mbps = record.download_mbps,
                    upload_mbps = record.upload_mbps,
                    ping_ms = record.ping_ms,
                    "measurement cycle completed"
                );
                let persisted = match self.sink.append_record(&record) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(cycle, error = %e, "failed to persist measurement");
                        false
                    }
                };
                (RunStatus::Success, Some(record), persisted)
            }
            Err(e) => {
                error!(cycle, kind = e.kind(), error = %e, "measurement cycle failed");
                (RunStatus::Failed, None, false)
            }
        };

        CycleOutcome {
            cycle,
            selection,
            used,
            status,
            record,
            persisted,
            failures,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn measure(&self, selection: Selection) -> Result<MeasurementRecord, TrialError> {
        let result = run_trial_bounded(
            self.port.as_ref(),
            selection.endpoint(),
            self.settings.trial_timeout,
        )
        .await?;
        MeasurementRecord::from_result(&result, selection.label())
    }

    async fn discover_in_cycle(&mut self, cycle: u64) {
        if self.request.explicit.is_some() || !self.request.optimize {
            info!(cycle, "discovery skipped: cached selection is not in use");
            return;
        }
        match selection::discover(
            self.port.as_ref(),
            self.directory.as_ref(),
            &self.cache,
            &self.settings.discovery,
        )
        .await
        {
            Ok(outcome) => {
                self.cached_failures = None;
                info!(cycle, endpoint = %outcome.best, "discovery refreshed preference");
            }
            Err(e) => warn!(cycle, error = %e, "discovery failed, keeping current preference"),
        }
    }

    fn note_cached_failure(&mut self, id: EndpointId) {
        let count = match self.cached_failures {
            Some((prev, n)) if prev == id => n + 1,
            _ => 1,
        };
        self.cached_failures = Some((id, count));

        let threshold = self.settings.failure_threshold;
        if threshold == 0 || count < threshold {
            return;
        }

        self.cached_failures = None;
        match self.cache.invalidate_if(id) {
            Ok(true) => {
                warn!(endpoint = %id, failures = count, "cached endpoint keeps failing, preference invalidated");
                if self.settings.rediscover_after_invalidate {
                    self.pending_discovery = true;
                }
            }
            Ok(false) => {}
            Err(e) => error!(endpoint = %id, error = %e, "failed to invalidate preference"),
        }
    }
}

/// Rate limiting is the provider throttling this host, not the endpoint failing.
fn counts_against_endpoint(err: &TrialError) -> bool {
    !matches!(err, TrialError::ProviderRateLimited { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiting_is_not_the_endpoints_fault() {
        assert!(!counts_against_endpoint(&TrialError::ProviderRateLimited {
            reason: "429".to_string()
        }));
        assert!(counts_against_endpoint(&TrialError::TimedOut { secs: 120 }));
        assert!(counts_against_endpoint(&TrialError::EndpointUnavailable {
            endpoint: "10".to_string(),
            reason: "gone".to_string()
        }));
    }

    #[test]
    fn test_next_delay_fixed_rate() {
        let interval = Duration::from_secs(600);
        assert_eq!(next_delay(interval, Duration::from_secs(45)), Duration::from_secs(555));
        assert_eq!(next_delay(interval, Duration::from_secs(600)), Duration::ZERO);
        assert_eq!(next_delay(interval, Duration::from_secs(900)), Duration::ZERO);
    }
}
