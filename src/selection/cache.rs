//! Durable best-server preference.
//!
//! One JSON file per installation. Writes go to a uniquely named sibling
//! temp file which is then renamed over the target, so a reader (possibly
//! another process) sees either the previous record or the new one.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::score::Ranking;
use crate::throughput::EndpointId;

pub const PREFERENCE_FILE_NAME: &str = "best_server.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("preference cache {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Last known best endpoint plus the scores of the discovery that chose it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceRecord {
    #[serde(default)]
    pub best_endpoint_id: Option<EndpointId>,
    #[serde(default)]
    pub candidate_scores: BTreeMap<EndpointId, f64>,
    pub last_updated: DateTime<Utc>,
}

impl PreferenceRecord {
    /// Build a fresh record from a discovery ranking. `None` if nothing ranked.
    pub fn from_ranking(ranking: &Ranking, now: DateTime<Utc>) -> Option<Self> {
        let best = ranking.best()?;
        Some(Self {
            best_endpoint_id: Some(best.endpoint_id),
            candidate_scores: ranking
                .ranked
                .iter()
                .map(|s| (s.endpoint_id, s.score))
                .collect(),
            last_updated: now,
        })
    }

    fn check(&self) -> std::result::Result<(), String> {
        if let Some(best) = self.best_endpoint_id {
            if !self.candidate_scores.contains_key(&best) {
                return Err(format!("best endpoint {} has no candidate score", best));
            }
        }
        if self.candidate_scores.values().any(|s| !s.is_finite()) {
            return Err("non-finite candidate score".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PreferenceCache {
    path: PathBuf,
}

impl PreferenceCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(PREFERENCE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current record. Missing or invalid content means "no cache".
    pub fn load(&self) -> Option<PreferenceRecord> {
        match self.try_load() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "ignoring preference cache");
                None
            }
        }
    }

    fn try_load(&self) -> std::result::Result<Option<PreferenceRecord>, CacheError> {
        let corrupt = |reason: String| CacheError::Corrupt {
            path: self.path.display().to_string(),
            reason,
        };

        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no preference cache yet");
                return Ok(None);
            }
            Err(e) => return Err(corrupt(e.to_string())),
        };
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(corrupt("file is empty".to_string()));
        }

        let record: PreferenceRecord =
            serde_json::from_slice(&data).map_err(|e| corrupt(e.to_string()))?;
        record.check().map_err(corrupt)?;
        Ok(Some(record))
    }

    /// Atomically replace the cache with `record`.
    pub fn save(&self, record: &PreferenceRecord) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create cache directory {}", dir.display()))?;

        let json =
            serde_json::to_vec_pretty(record).context("failed to serialize preference record")?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| PREFERENCE_FILE_NAME.to_string());
        let temp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let write_result = (|| -> Result<()> {
            let mut file = fs::File::create(&temp_path)
                .with_context(|| format!("failed to create {}", temp_path.display()))?;
            file.write_all(&json)
                .with_context(|| format!("failed to write {}", temp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", temp_path.display()))?;
            fs::rename(&temp_path, &self.path).with_context(|| {
                format!(
                    "failed to rename {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            })
        })();

        if write_result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        write_result?;
        sync_dir(dir)?;

        info!(
            path = %self.path.display(),
            best = ?record.best_endpoint_id,
            candidates = record.candidate_scores.len(),
            "preference cache saved"
        );
        Ok(())
    }

    /// Clear the best-endpoint pointer, keeping candidate scores for diagnostics.
    ///
    /// Returns `true` if a pointer was cleared.
    pub fn invalidate(&self) -> Result<bool> {
        self.clear_pointer(None)
    }

    /// Clear the pointer only if it still names `expected`.
    ///
    /// A preference rewritten since `expected` was read (for example by a
    /// `find-best` run in another process) is left alone.
    pub fn invalidate_if(&self, expected: EndpointId) -> Result<bool> {
        self.clear_pointer(Some(expected))
    }

    fn clear_pointer(&self, expected: Option<EndpointId>) -> Result<bool> {
        let Some(mut record) = self.load() else {
            return Ok(false);
        };
        if let (Some(expected), Some(current)) = (expected, record.best_endpoint_id) {
            if current != expected {
                debug!(%expected, %current, "preference changed since it was read, not invalidating");
                return Ok(false);
            }
        }
        let Some(previous) = record.best_endpoint_id.take() else {
            return Ok(false);
        };
        record.last_updated = Utc::now();
        self.save(&record)?;
        info!(endpoint = %previous, "cached best endpoint invalidated");
        Ok(true)
    }
}

/// Flush the directory entry so a completed rename survives power loss.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("failed to sync directory {}", dir.display()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
