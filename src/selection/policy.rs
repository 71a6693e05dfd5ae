//! Per-cycle endpoint selection.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use super::cache::PreferenceCache;
use crate::throughput::EndpointId;

/// What the caller asked for this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRequest {
    /// Operator-supplied endpoint; bypasses cache and discovery.
    pub explicit: Option<EndpointId>,
    /// Use the cached best endpoint when one exists.
    pub optimize: bool,
}

impl Default for SelectionRequest {
    fn default() -> Self {
        Self {
            explicit: None,
            optimize: true,
        }
    }
}

/// The endpoint decision for one measurement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "endpoint", rename_all = "snake_case")]
pub enum Selection {
    Explicit(EndpointId),
    CachedPreferred(EndpointId),
    ProviderDefault,
}

impl Selection {
    /// Endpoint to hand to the measurement port.
    pub fn endpoint(&self) -> Option<EndpointId> {
        match self {
            Selection::Explicit(id) | Selection::CachedPreferred(id) => Some(*id),
            Selection::ProviderDefault => None,
        }
    }

    /// Where to go after this selection failed within a cycle.
    ///
    /// Only a cached preference falls back; explicit requests surface their
    /// failure and the provider default has nothing behind it.
    pub fn fallback(&self) -> Option<Selection> {
        match self {
            Selection::CachedPreferred(_) => Some(Selection::ProviderDefault),
            Selection::Explicit(_) | Selection::ProviderDefault => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Selection::Explicit(_) => "explicit",
            Selection::CachedPreferred(_) => "cached",
            Selection::ProviderDefault => "provider_default",
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint() {
            Some(id) => write!(f, "{} ({})", self.label(), id),
            None => write!(f, "{}", self.label()),
        }
    }
}

/// Decide the endpoint for a cycle. The cache is read fresh on every call so a
/// preference written by another process is picked up without restart.
pub fn resolve(request: &SelectionRequest, cache: &PreferenceCache) -> Selection {
    if let Some(id) = request.explicit {
        return Selection::Explicit(id);
    }
    if !request.optimize {
        return Selection::ProviderDefault;
    }
    match cache.load().and_then(|r| r.best_endpoint_id) {
        Some(id) => Selection::CachedPreferred(id),
        None => {
            debug!("no cached best endpoint, using provider default");
            Selection::ProviderDefault
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::cache::PreferenceRecord;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn cache_with_best(dir: &std::path::Path, best: Option<u32>) -> PreferenceCache {
        let cache = PreferenceCache::in_dir(dir);
        let mut scores = BTreeMap::new();
        scores.insert(EndpointId(10), 90.0);
        scores.insert(EndpointId(20), 50.0);
        cache
            .save(&PreferenceRecord {
                best_endpoint_id: best.map(EndpointId),
                candidate_scores: scores,
                last_updated: Utc::now(),
            })
            .unwrap();
        cache
    }

    #[test]
    fn test_cached_best_is_selected() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = cache_with_best(dir.path(), Some(10));
        let sel = resolve(&SelectionRequest::default(), &cache);
        assert_eq!(sel, Selection::CachedPreferred(EndpointId(10)));
        assert_eq!(sel.endpoint(), Some(EndpointId(10)));
    }

    #[test]
    fn test_explicit_wins_even_when_unknown() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = cache_with_best(dir.path(), Some(10));
        let req = SelectionRequest {
            explicit: Some(EndpointId(999)),
            optimize: true,
        };
        assert_eq!(resolve(&req, &cache), Selection::Explicit(EndpointId(999)));

        let req = SelectionRequest {
            explicit: Some(EndpointId(999)),
            optimize: false,
        };
        assert_eq!(resolve(&req, &cache), Selection::Explicit(EndpointId(999)));
    }

    #[test]
    fn test_disabled_optimization_uses_provider_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = cache_with_best(dir.path(), Some(10));
        let req = SelectionRequest {
            explicit: None,
            optimize: false,
        };
        assert_eq!(resolve(&req, &cache), Selection::ProviderDefault);
    }

    #[test]
    fn test_no_cache_or_invalidated_uses_provider_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let empty = PreferenceCache::in_dir(&dir.path().join("none"));
        assert_eq!(
            resolve(&SelectionRequest::default(), &empty),
            Selection::ProviderDefault
        );

        let cache = cache_with_best(dir.path(), None);
        assert_eq!(
            resolve(&SelectionRequest::default(), &cache),
            Selection::ProviderDefault
        );
    }

    #[test]
    fn test_only_cached_selection_falls_back() {
        assert_eq!(
            Selection::CachedPreferred(EndpointId(1)).fallback(),
            Some(Selection::ProviderDefault)
        );
        assert_eq!(Selection::Explicit(EndpointId(1)).fallback(), None);
        assert_eq!(Selection::ProviderDefault.fallback(), None);
    }
}
