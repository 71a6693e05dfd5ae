//! Adaptive speed test server selection: scoring, the durable preference,
//! per-cycle resolution, and explicit discovery.

pub mod cache;
pub mod discovery;
pub mod policy;
pub mod score;

pub use cache::{PreferenceCache, PreferenceRecord};
pub use discovery::{discover, DiscoveryError, DiscoveryOptions, DiscoveryOutcome};
pub use policy::{resolve, Selection, SelectionRequest};
pub use score::{rank, Ranking, ScoreError, ScoredEndpoint};
