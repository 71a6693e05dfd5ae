//! Outcome tracking for measurement cycles.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::selection::Selection;
use crate::storage::MeasurementRecord;
use crate::throughput::TrialError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Success,
    Failed,
}

/// What happened in one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub cycle: u64,
    /// Selection resolved at the start of the cycle.
    pub selection: Selection,
    /// Selection that produced the final attempt (differs after a fallback).
    pub used: Selection,
    pub status: RunStatus,
    pub record: Option<MeasurementRecord>,
    /// Whether the record reached the sink.
    pub persisted: bool,
    #[serde(serialize_with = "serialize_errors")]
    pub failures: Vec<TrialError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleOutcome {
    pub fn fell_back(&self) -> bool {
        self.used != self.selection
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

fn serialize_errors<S>(errors: &[TrialError], s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.collect_seq(errors.iter().map(|e| e.to_string()))
}

/// Running totals for a continuous run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub persisted: u64,
    pub fallbacks: u64,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &CycleOutcome) {
        self.attempted += 1;
        match outcome.status {
            RunStatus::Success => self.succeeded += 1,
            RunStatus::Failed => self.failed += 1,
        }
        if outcome.persisted {
            self.persisted += 1;
        }
        if outcome.fell_back() {
            self.fallbacks += 1;
        }
    }
}
