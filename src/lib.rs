//! Vehicle make/model image dataset collection.
//!
//! For every (make, model) entity, search queries are planned across
//! orientations and years, candidate images are fetched into scratch
//! directories, near-duplicates are rejected by perceptual hash, and accepted
//! images are moved into `<dataset>/<make>_<model>/` and shrunk to a size
//! budget.

pub mod config;
pub mod dedup;
pub mod entity;
pub mod fetch;
pub mod normalize;
pub mod orchestrator;
pub mod planner;
pub mod scan;

pub use config::{CollectConfig, ConfigError, FetcherConfig, HashAlgorithm};
pub use dedup::{find_duplicate_groups, DedupIndex, DedupVerdict, PerceptualHasher};
pub use entity::{entities_from_catalog, CatalogEntry, DatasetEntity};
pub use fetch::{build_fetcher, FetchFailure, ImageFetcher};
pub use normalize::{NormalizeOutcome, SizeNormalizer};
pub use orchestrator::{EntityReport, Orchestrator, OrchestratorError, RouteOutcome};
pub use planner::{plan, QueryDescriptor};
