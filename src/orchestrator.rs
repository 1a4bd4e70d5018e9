//! Drives collection for a list of entities.
//!
//! Per entity: create the final folder, optionally seed the dedup index from
//! it, then for each planned query fetch into a private scratch directory,
//! route every candidate through the index on a bounded worker pool, and
//! remove the scratch directory. Nothing below entity setup aborts the run.

use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use rand::Rng;
use rayon::prelude::*;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;

use crate::config::{CollectConfig, ConfigError};
use crate::dedup::{DedupIndex, DedupVerdict};
use crate::entity::DatasetEntity;
use crate::fetch::{FetchFailure, ImageFetcher};
use crate::normalize::{NormalizeOutcome, SizeNormalizer};
use crate::planner::{plan, QueryDescriptor};
use crate::scan::scan_images;

/// Attempts before giving up on reserving a destination name.
const MAX_NAME_ATTEMPTS: usize = 1000;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// What happened to one candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Accepted {
        path: PathBuf,
        normalize: NormalizeOutcome,
    },
    Duplicate {
        first_seen: PathBuf,
    },
    Unreadable {
        reason: String,
    },
    /// Unique, but the move into the final folder failed. The hash was
    /// released so a later copy can still be admitted.
    CommitFailed {
        reason: String,
    },
}

/// Per-entity completion record.
#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub make: String,
    pub model: String,
    pub folder: PathBuf,
    pub setup_error: Option<String>,
    pub seeded: usize,
    pub queries_planned: usize,
    pub queries_fetched: usize,
    pub queries_empty: usize,
    pub queries_failed: usize,
    pub files_seen: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub unreadable: usize,
    pub commit_failures: usize,
    pub within_budget: usize,
    pub compressed: usize,
    pub floor_reached: usize,
    pub normalize_failures: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EntityReport {
    fn new(entity: &DatasetEntity, folder: PathBuf) -> Self {
        Self {
            make: entity.make.clone(),
            model: entity.model.clone(),
            folder,
            setup_error: None,
            seeded: 0,
            queries_planned: 0,
            queries_fetched: 0,
            queries_empty: 0,
            queries_failed: 0,
            files_seen: 0,
            accepted: 0,
            duplicates: 0,
            unreadable: 0,
            commit_failures: 0,
            within_budget: 0,
            compressed: 0,
            floor_reached: 0,
            normalize_failures: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn record(&mut self, outcome: &RouteOutcome) {
        match outcome {
            RouteOutcome::Accepted { normalize, .. } => {
                self.accepted += 1;
                match normalize {
                    NormalizeOutcome::WithinBudget { .. } => self.within_budget += 1,
                    NormalizeOutcome::Compressed { .. } => self.compressed += 1,
                    NormalizeOutcome::FloorReached { .. } => self.floor_reached += 1,
                    NormalizeOutcome::Failed { .. } => self.normalize_failures += 1,
                }
            }
            RouteOutcome::Duplicate { .. } => self.duplicates += 1,
            RouteOutcome::Unreadable { .. } => self.unreadable += 1,
            RouteOutcome::CommitFailed { .. } => self.commit_failures += 1,
        }
    }

    /// Files removed from scratch without being committed.
    pub fn rejected(&self) -> usize {
        self.duplicates + self.unreadable + self.commit_failures
    }
}

pub struct Orchestrator {
    config: CollectConfig,
    fetcher: Box<dyn ImageFetcher>,
    normalizer: SizeNormalizer,
    pool: rayon::ThreadPool,
    progress: Option<ProgressBar>,
}

impl Orchestrator {
    pub fn new(config: CollectConfig, fetcher: Box<dyn ImageFetcher>) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let normalizer = SizeNormalizer::new(config.target_bytes())
            .with_tolerance(config.tolerance_bytes())
            .with_quality(config.initial_quality, config.quality_step, config.min_quality);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.concurrency)
            .thread_name(|i| format!("carset-route-{}", i))
            .build()?;

        Ok(Self {
            config,
            fetcher,
            normalizer,
            pool,
            progress: None,
        })
    }

    /// Advance `progress` once per query; its length is reset per entity.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &CollectConfig {
        &self.config
    }

    /// Collect every entity in order, each with a fresh index.
    pub fn run(&self, entities: &[DatasetEntity]) -> Vec<EntityReport> {
        entities.iter().map(|entity| self.run_entity(entity)).collect()
    }

    pub fn run_entity(&self, entity: &DatasetEntity) -> EntityReport {
        let folder = entity.final_folder(&self.config.dataset_root);
        let mut report = EntityReport::new(entity, folder.clone());

        let scratch_root = self.config.scratch_root();
        for dir in [&folder, &scratch_root] {
            if let Err(e) = fs::create_dir_all(dir) {
                log::error!("Failed to create {}: {}; skipping {}", dir.display(), e, entity);
                report.setup_error = Some(format!("{}: {}", dir.display(), e));
                report.finished_at = Some(Utc::now());
                return report;
            }
        }

        let index = DedupIndex::new(self.config.hash_algorithm);
        if self.config.seed_existing {
            report.seeded = index.seed_from_dir(&folder, &self.config.extensions);
            if report.seeded > 0 {
                log::info!("Seeded {} known images for {}", report.seeded, entity);
            }
        }

        let queries = plan(
            entity,
            &self.config.orientations,
            &self.config.years,
            &self.config.exclusions,
        );
        report.queries_planned = queries.len();

        if let Some(progress) = &self.progress {
            progress.reset();
            progress.set_length(queries.len() as u64);
            progress.set_message(entity.to_string());
        }

        for (i, query) in queries.iter().enumerate() {
            if i > 0 {
                self.pace();
            }
            self.process_query(query, &scratch_root, &folder, &index, &mut report);
            if let Some(progress) = &self.progress {
                progress.inc(1);
            }
        }

        report.finished_at = Some(Utc::now());
        log::info!(
            "Download complete for {}: {} accepted, {} rejected, {} of {} queries failed",
            entity,
            report.accepted,
            report.rejected(),
            report.queries_failed,
            report.queries_planned
        );
        report
    }

    fn process_query(
        &self,
        query: &QueryDescriptor,
        scratch_root: &Path,
        folder: &Path,
        index: &DedupIndex,
        report: &mut EntityReport,
    ) {
        let text = query.render();
        let prefix = format!("{}-{}-", query.entity.scratch_tag(), query.file_prefix());
        let scratch = match tempfile::Builder::new().prefix(&prefix).tempdir_in(scratch_root) {
            Ok(dir) => dir,
            Err(e) => {
                log::error!("Failed to create scratch directory for '{}': {}", text, e);
                report.queries_failed += 1;
                return;
            }
        };

        log::info!("Downloading {} images for '{}'", self.config.images_per_query, text);
        match self.fetch_with_retries(&text, scratch.path()) {
            Ok(0) => {
                log::info!("No images returned for '{}'", text);
                report.queries_empty += 1;
            }
            Ok(count) => {
                report.queries_fetched += 1;
                log::debug!("{} returned {} files for '{}'", self.fetcher.name(), count, text);
                for outcome in self.route_batch(query, scratch.path(), folder, index) {
                    report.files_seen += 1;
                    report.record(&outcome);
                }
            }
            Err(e) => {
                log::warn!("Error downloading images for '{}': {}", text, e);
                report.queries_failed += 1;
            }
        }

        release_scratch(scratch);
    }

    fn fetch_with_retries(&self, query: &str, output_dir: &Path) -> Result<usize, FetchFailure> {
        let attempts = self.config.fetch_retries + 1;
        let mut attempt = 1;
        loop {
            match self
                .fetcher
                .fetch(query, self.config.images_per_query, output_dir)
            {
                Ok(count) => return Ok(count),
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "Fetch attempt {}/{} failed for '{}': {}; retrying",
                        attempt,
                        attempts,
                        query,
                        e
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Route every image under `scratch` on the worker pool. Returns once the
    /// whole batch is done, so the scratch directory is free to delete.
    fn route_batch(
        &self,
        query: &QueryDescriptor,
        scratch: &Path,
        folder: &Path,
        index: &DedupIndex,
    ) -> Vec<RouteOutcome> {
        let files = scan_images(scratch, &self.config.extensions);
        let prefix = query.file_prefix();
        self.pool.install(|| {
            files
                .par_iter()
                .map(|file| route_file(file, &prefix, folder, index, &self.normalizer))
                .collect()
        })
    }

    fn pace(&self) {
        let (min, max) = (self.config.pace_min_ms, self.config.pace_max_ms);
        if max == 0 {
            return;
        }
        let millis = if min >= max {
            max
        } else {
            rand::rng().random_range(min..=max)
        };
        thread::sleep(Duration::from_millis(millis));
    }
}

/// Gate one candidate: dedup, then commit and normalize, or delete.
pub fn route_file(
    candidate: &Path,
    prefix: &str,
    folder: &Path,
    index: &DedupIndex,
    normalizer: &SizeNormalizer,
) -> RouteOutcome {
    match index.check_and_register(candidate) {
        DedupVerdict::Unique { hash } => {
            let original = candidate
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .into_owned();
            let name = format!("{}_{}", prefix, original);

            match commit(candidate, folder, &name) {
                Ok(path) => {
                    index.relocate(&hash, &path);
                    let normalize = normalizer.normalize(&path);
                    RouteOutcome::Accepted { path, normalize }
                }
                Err(e) => {
                    log::warn!("Failed to move {} into {}: {}", candidate.display(), folder.display(), e);
                    index.forget(&hash);
                    discard(candidate);
                    RouteOutcome::CommitFailed {
                        reason: e.to_string(),
                    }
                }
            }
        }
        DedupVerdict::Duplicate { first_seen } => {
            log::debug!("{} duplicates {}", candidate.display(), first_seen.display());
            discard(candidate);
            RouteOutcome::Duplicate { first_seen }
        }
        DedupVerdict::Unreadable { reason } => {
            discard(candidate);
            RouteOutcome::Unreadable { reason }
        }
    }
}

/// Move `candidate` into `folder` as `name`, or `name` with a numeric suffix
/// if that is taken. A failed move is retried once after recreating `folder`;
/// siblings with the same hash may already be deleted as duplicates.
fn commit(candidate: &Path, folder: &Path, name: &str) -> std::io::Result<PathBuf> {
    match try_commit(candidate, folder, name) {
        Ok(dest) => Ok(dest),
        Err(e) => {
            log::debug!("Retrying move of {} after: {}", candidate.display(), e);
            fs::create_dir_all(folder)?;
            try_commit(candidate, folder, name)
        }
    }
}

fn try_commit(candidate: &Path, folder: &Path, name: &str) -> std::io::Result<PathBuf> {
    let dest = reserve_destination(folder, name)?;
    if let Err(e) = move_file(candidate, &dest) {
        let _ = fs::remove_file(&dest);
        return Err(e);
    }
    Ok(dest)
}

/// Claim a free file name by creating it exclusively. The placeholder is
/// replaced by the subsequent rename.
pub fn reserve_destination(folder: &Path, name: &str) -> std::io::Result<PathBuf> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    for n in 0..MAX_NAME_ATTEMPTS {
        let candidate = match (n, ext) {
            (0, _) => folder.join(name),
            (_, Some(ext)) => folder.join(format!("{}-{}.{}", stem, n, ext)),
            (_, None) => folder.join(format!("{}-{}", stem, n)),
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", name, folder.display()),
    ))
}

fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    // Scratch and dataset may sit on different filesystems.
    fs::copy(src, dest)?;
    fs::remove_file(src)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        log::warn!("Failed to delete {}: {}", path.display(), e);
    }
}

fn release_scratch(scratch: TempDir) {
    let path = scratch.path().to_path_buf();
    if let Err(e) = scratch.close() {
        log::warn!("Failed to remove scratch directory {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::test_images::{checker, noise, split_horizontal, split_vertical};
    use crate::dedup::PerceptualHasher;
    use crate::config::HashAlgorithm;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    type Script = dyn Fn(&str, &Path) -> Result<usize, FetchFailure> + Send + Sync;

    /// Runs a closure per query and records the queries it was asked for.
    struct ScriptedFetcher {
        script: Box<Script>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedFetcher {
        fn new<F>(script: F) -> (Self, Arc<Mutex<Vec<String>>>)
        where
            F: Fn(&str, &Path) -> Result<usize, FetchFailure> + Send + Sync + 'static,
        {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let fetcher = Self {
                script: Box::new(script),
                calls: Arc::clone(&calls),
            };
            (fetcher, calls)
        }
    }

    impl ImageFetcher for ScriptedFetcher {
        fn fetch(&self, query: &str, _limit: usize, output_dir: &Path) -> Result<usize, FetchFailure> {
            self.calls.lock().unwrap().push(query.to_string());
            (self.script)(query, output_dir)
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn test_config(root: &Path) -> CollectConfig {
        CollectConfig {
            dataset_root: root.join("dataset"),
            scratch_root: Some(root.join("scratch")),
            orientations: vec!["front".to_string()],
            years: vec![2020],
            exclusions: Vec::new(),
            ..CollectConfig::default()
        }
    }

    fn folder_names(folder: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(folder)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn scratch_is_empty(root: &Path) -> bool {
        fs::read_dir(root.join("scratch")).unwrap().next().is_none()
    }

    #[test]
    fn test_duplicate_pair_commits_two_of_three() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (fetcher, _) = ScriptedFetcher::new(|query, dir| {
            let nested = dir.join(query);
            fs::create_dir_all(&nested)?;
            split_vertical(&nested.join("Image_1.png"), 64, 64);
            split_vertical(&nested.join("Image_2.png"), 64, 64);
            split_horizontal(&nested.join("Image_3.png"), 64, 64);
            Ok(3)
        });

        let orchestrator =
            Orchestrator::new(test_config(temp_dir.path()), Box::new(fetcher)).unwrap();
        let report = orchestrator.run_entity(&DatasetEntity::new("Toyota", "Vios"));

        assert_eq!(report.files_seen, 3);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.duplicates, 1);
        assert!(report.finished_at.is_some());

        let folder = temp_dir.path().join("dataset").join("toyota_vios");
        let names = folder_names(&folder);
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"front_2020_Image_3.png".to_string()));
        assert!(names.iter().all(|n| n.starts_with("front_2020_Image_")));
        assert!(scratch_is_empty(temp_dir.path()));
    }

    #[test]
    fn test_fetch_failure_skips_to_next_query() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (fetcher, calls) = ScriptedFetcher::new(|query, dir| {
            if query.contains("2020") {
                return Err(FetchFailure::Network("connection reset".to_string()));
            }
            split_vertical(&dir.join("Image_1.jpg"), 64, 64);
            Ok(1)
        });

        let mut config = test_config(temp_dir.path());
        config.years = vec![2020, 2021];
        let orchestrator = Orchestrator::new(config, Box::new(fetcher)).unwrap();
        let report = orchestrator.run_entity(&DatasetEntity::new("Toyota", "Vios"));

        assert_eq!(report.queries_failed, 1);
        assert_eq!(report.queries_fetched, 1);
        assert_eq!(report.accepted, 1);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("2020"));
        assert!(calls[1].contains("2021"));

        let names = folder_names(&temp_dir.path().join("dataset").join("toyota_vios"));
        assert_eq!(names, vec!["front_2021_Image_1.jpg".to_string()]);
        assert!(scratch_is_empty(temp_dir.path()));
    }

    #[test]
    fn test_corrupt_candidate_is_deleted_not_indexed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (fetcher, _) = ScriptedFetcher::new(|_, dir| {
            fs::write(dir.join("Image_1.jpg"), b"<html>403 Forbidden</html>")?;
            checker(&dir.join("Image_2.png"), 64, 64);
            Ok(2)
        });

        let orchestrator =
            Orchestrator::new(test_config(temp_dir.path()), Box::new(fetcher)).unwrap();
        let report = orchestrator.run_entity(&DatasetEntity::new("Honda", "City"));

        assert_eq!(report.unreadable, 1);
        assert_eq!(report.accepted, 1);
        let names = folder_names(&temp_dir.path().join("dataset").join("honda_city"));
        assert_eq!(names, vec!["front_2020_Image_2.png".to_string()]);
        assert!(scratch_is_empty(temp_dir.path()));
    }

    #[test]
    fn test_every_query_issued_even_when_all_fail() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (fetcher, calls) =
            ScriptedFetcher::new(|_, _| Err(FetchFailure::Timeout(Duration::from_secs(60))));

        let mut config = test_config(temp_dir.path());
        config.orientations = vec!["front".into(), "side".into(), "back".into()];
        config.years = vec![2016, 2024];
        let orchestrator = Orchestrator::new(config, Box::new(fetcher)).unwrap();
        let report = orchestrator.run_entity(&DatasetEntity::new("Ford", "Ranger"));

        assert_eq!(report.queries_planned, 6);
        assert_eq!(report.queries_failed, 6);
        assert_eq!(report.accepted, 0);

        let issued: HashSet<String> = calls.lock().unwrap().iter().cloned().collect();
        assert_eq!(issued.len(), 6);
        for orientation in ["front", "side", "back"] {
            for year in [2016, 2024] {
                let expected = format!("Ford Ranger {} {} view car", year, orientation);
                assert!(issued.contains(&expected), "missing {}", expected);
            }
        }
    }

    #[test]
    fn test_empty_fetch_is_not_a_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (fetcher, _) = ScriptedFetcher::new(|_, _| Ok(0));

        let orchestrator =
            Orchestrator::new(test_config(temp_dir.path()), Box::new(fetcher)).unwrap();
        let report = orchestrator.run_entity(&DatasetEntity::new("Kia", "Rio"));

        assert_eq!(report.queries_empty, 1);
        assert_eq!(report.queries_failed, 0);
        assert!(folder_names(&report.folder).is_empty());
        assert!(scratch_is_empty(temp_dir.path()));
    }

    fn accepted_hashes(folder: &Path) -> HashSet<String> {
        let hasher = PerceptualHasher::new(HashAlgorithm::Mean);
        fs::read_dir(folder)
            .unwrap()
            .map(|e| hasher.hash_file(&e.unwrap().path()).unwrap())
            .collect()
    }

    #[test]
    fn test_pool_size_does_not_change_accepted_set() {
        let write_batch = |_: &str, dir: &Path| -> Result<usize, FetchFailure> {
            for copy in 0..4 {
                split_vertical(&dir.join(format!("v_{}.png", copy)), 64, 64);
                split_horizontal(&dir.join(format!("h_{}.png", copy)), 64, 64);
                checker(&dir.join(format!("c_{}.png", copy)), 64, 64);
            }
            Ok(12)
        };

        let mut results = Vec::new();
        for concurrency in [1, 4] {
            let temp_dir = tempfile::tempdir().unwrap();
            let (fetcher, _) = ScriptedFetcher::new(write_batch);
            let mut config = test_config(temp_dir.path());
            config.concurrency = concurrency;

            let orchestrator = Orchestrator::new(config, Box::new(fetcher)).unwrap();
            let report = orchestrator.run_entity(&DatasetEntity::new("Mazda", "CX-5"));
            assert_eq!(report.accepted, 3);
            assert_eq!(report.duplicates, 9);

            results.push(accepted_hashes(&report.folder));
        }

        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn test_seeding_prevents_readmission_across_runs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let script = |_: &str, dir: &Path| -> Result<usize, FetchFailure> {
            split_vertical(&dir.join("Image_1.png"), 64, 64);
            Ok(1)
        };
        let entity = DatasetEntity::new("Suzuki", "Jimny");

        let (fetcher, _) = ScriptedFetcher::new(script);
        let first = Orchestrator::new(test_config(temp_dir.path()), Box::new(fetcher))
            .unwrap()
            .run_entity(&entity);
        assert_eq!(first.accepted, 1);

        let (fetcher, _) = ScriptedFetcher::new(script);
        let second = Orchestrator::new(test_config(temp_dir.path()), Box::new(fetcher))
            .unwrap()
            .run_entity(&entity);
        assert_eq!(second.seeded, 1);
        assert_eq!(second.accepted, 0);
        assert_eq!(second.duplicates, 1);

        // Without seeding the same image is admitted again under a new name.
        let (fetcher, _) = ScriptedFetcher::new(script);
        let mut config = test_config(temp_dir.path());
        config.seed_existing = false;
        let third = Orchestrator::new(config, Box::new(fetcher))
            .unwrap()
            .run_entity(&entity);
        assert_eq!(third.accepted, 1);
        assert_eq!(
            folder_names(&third.folder),
            vec![
                "front_2020_Image_1-1.png".to_string(),
                "front_2020_Image_1.png".to_string()
            ]
        );
    }

    #[test]
    fn test_indexes_are_not_shared_between_entities() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (fetcher, _) = ScriptedFetcher::new(|_, dir| {
            split_vertical(&dir.join("Image_1.png"), 64, 64);
            Ok(1)
        });

        let orchestrator =
            Orchestrator::new(test_config(temp_dir.path()), Box::new(fetcher)).unwrap();
        let reports = orchestrator.run(&[
            DatasetEntity::new("Toyota", "Vios"),
            DatasetEntity::new("Toyota", "Wigo"),
        ]);

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.accepted == 1));
    }

    #[test]
    fn test_retry_recovers_transient_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let (fetcher, _) = ScriptedFetcher::new(move |_, dir| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(FetchFailure::Network("503".to_string()));
            }
            checker(&dir.join("Image_1.png"), 64, 64);
            Ok(1)
        });

        let mut config = test_config(temp_dir.path());
        config.fetch_retries = 1;
        let orchestrator = Orchestrator::new(config, Box::new(fetcher)).unwrap();
        let report = orchestrator.run_entity(&DatasetEntity::new("Nissan", "Terra"));

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(report.queries_failed, 0);
        assert_eq!(report.accepted, 1);
    }

    #[test]
    fn test_committed_images_are_normalized() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (fetcher, _) = ScriptedFetcher::new(|_, dir| {
            noise(&dir.join("Image_1.png"), 400, 400, 5);
            Ok(1)
        });

        let orchestrator =
            Orchestrator::new(test_config(temp_dir.path()), Box::new(fetcher)).unwrap();
        let report = orchestrator.run_entity(&DatasetEntity::new("Subaru", "WRX"));

        assert_eq!(report.accepted, 1);
        assert_eq!(report.compressed + report.floor_reached, 1);
        let committed = report.folder.join("front_2020_Image_1.png");
        let size = fs::metadata(&committed).unwrap().len();
        if report.compressed == 1 {
            assert!(size <= 100 * 1024);
        }
    }

    #[test]
    fn test_commit_recovers_when_folder_disappears() {
        let temp_dir = tempfile::tempdir().unwrap();
        let candidate = temp_dir.path().join("Image_1.png");
        checker(&candidate, 64, 64);
        let folder = temp_dir.path().join("dataset").join("honda_city");

        let index = DedupIndex::new(HashAlgorithm::Mean);
        let normalizer = SizeNormalizer::new(1 << 20);
        let outcome = route_file(&candidate, "front_2020", &folder, &index, &normalizer);

        let committed = folder.join("front_2020_Image_1.png");
        assert!(matches!(outcome, RouteOutcome::Accepted { ref path, .. } if *path == committed));
        assert!(committed.exists());
        assert!(!candidate.exists());
    }

    #[test]
    fn test_permanent_commit_failure_releases_hash() {
        let temp_dir = tempfile::tempdir().unwrap();
        let candidate = temp_dir.path().join("Image_1.png");
        checker(&candidate, 64, 64);
        let folder = temp_dir.path().join("not_a_folder");
        fs::write(&folder, b"file in the way").unwrap();

        let index = DedupIndex::new(HashAlgorithm::Mean);
        let normalizer = SizeNormalizer::new(1 << 20);
        let outcome = route_file(&candidate, "front_2020", &folder, &index, &normalizer);

        assert!(matches!(outcome, RouteOutcome::CommitFailed { .. }));
        assert!(index.is_empty());
        assert!(!candidate.exists());
    }

    #[test]
    fn test_reserve_destination_adds_suffix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let first = reserve_destination(temp_dir.path(), "front_2020_Image_1.jpg").unwrap();
        let second = reserve_destination(temp_dir.path(), "front_2020_Image_1.jpg").unwrap();
        let bare = reserve_destination(temp_dir.path(), "noext").unwrap();
        let bare_again = reserve_destination(temp_dir.path(), "noext").unwrap();

        assert_eq!(first, temp_dir.path().join("front_2020_Image_1.jpg"));
        assert_eq!(second, temp_dir.path().join("front_2020_Image_1-1.jpg"));
        assert_eq!(bare, temp_dir.path().join("noext"));
        assert_eq!(bare_again, temp_dir.path().join("noext-1"));
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let (fetcher, _) = ScriptedFetcher::new(|_, _| Ok(0));
        let mut config = CollectConfig::default();
        config.concurrency = 0;
        assert!(matches!(
            Orchestrator::new(config, Box::new(fetcher)),
            Err(OrchestratorError::Config(_))
        ));
    }
}
