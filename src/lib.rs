//! speedwatch -- continuous internet speed monitoring with adaptive server selection.
//!
//! This crate provides the core library for choosing, remembering, and
//! falling back between speed test servers, and for scheduling measurement
//! cycles against them.

pub mod config;
pub mod scheduler;
pub mod selection;
pub mod storage;
pub mod throughput;

use std::sync::Arc;

use anyhow::{Context, Result};

use config::MonitorConfig;
use scheduler::{Scheduler, SchedulerSettings};
use selection::{PreferenceCache, SelectionRequest};
use storage::SqliteRecordSink;
use throughput::provider::ookla::OoklaProvider;

/// The configured speed test provider.
pub fn provider_from_config(cfg: &MonitorConfig) -> OoklaProvider {
    OoklaProvider::new(&cfg.provider.speedtest_path, cfg.provider.accept_license)
}

pub fn scheduler_settings(cfg: &MonitorConfig) -> SchedulerSettings {
    SchedulerSettings {
        trial_timeout: cfg.trial_timeout(),
        discovery: cfg.discovery_options(),
        failure_threshold: cfg.selection.failure_threshold,
        rediscover_after_invalidate: cfg.selection.rediscover_after_invalidate,
    }
}

/// Wire the Ookla provider, preference cache, and SQLite sink into a scheduler.
pub fn build_scheduler(cfg: &MonitorConfig, request: SelectionRequest) -> Result<Scheduler> {
    let provider = Arc::new(provider_from_config(cfg));

    let db_path = cfg.database_path();
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let sink = SqliteRecordSink::open(&db_path.to_string_lossy())
        .with_context(|| format!("failed to open measurement database {}", db_path.display()))?;

    let cache = PreferenceCache::new(cfg.preference_path());

    Ok(Scheduler::new(
        provider.clone(),
        provider,
        cache,
        Arc::new(sink),
        scheduler_settings(cfg),
    )
    .with_request(request))
}
