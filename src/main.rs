use anyhow::{Context, Result};
use carset::{
    build_fetcher, entities_from_catalog, find_duplicate_groups, plan, CollectConfig,
    DatasetEntity, EntityReport, HashAlgorithm, Orchestrator,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "carset", version, about = "Collect a labeled vehicle image dataset")]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch, dedupe and store images for every configured make/model
    Collect {
        #[command(flatten)]
        source: ConfigArgs,
        /// Images requested per query
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
        /// Worker threads for routing fetched files
        #[arg(long, value_name = "K")]
        concurrency: Option<usize>,
        /// Size budget for stored images, in KB
        #[arg(long, value_name = "KB")]
        target_kb: Option<u64>,
        /// Perceptual hash used for duplicate detection
        #[arg(long, value_enum)]
        algorithm: Option<HashAlgorithm>,
        /// Do not pre-register images already in the dataset
        #[arg(long)]
        no_seed: bool,
        /// Write per-entity reports as JSON
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// Print the queries `collect` would issue
    Plan {
        #[command(flatten)]
        source: ConfigArgs,
    },

    /// Find duplicate images in an existing dataset folder
    Audit {
        /// Folder to audit
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Config file whose `extensions` list is used when --ext is absent
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Image extension to include (repeatable)
        #[arg(long = "ext", value_name = "EXT")]
        extensions: Vec<String>,
        #[arg(long, value_enum, default_value_t = HashAlgorithm::Mean)]
        algorithm: HashAlgorithm,
        /// Delete all but the oldest image of each group
        #[arg(long)]
        delete: bool,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Config file (default: the platform config dir's carset/config.toml, if present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Dataset root directory
    #[arg(short, long, value_name = "DIR")]
    dataset: Option<PathBuf>,
    /// Make to collect; pair each with a --model, replacing the config catalog
    #[arg(long)]
    make: Vec<String>,
    #[arg(long)]
    model: Vec<String>,
}

impl ConfigArgs {
    fn load(&self) -> Result<CollectConfig> {
        let mut config = CollectConfig::load_or_default(self.config.as_deref())?;
        if let Some(dataset) = &self.dataset {
            config.dataset_root = dataset.clone();
        }
        Ok(config)
    }

    fn entities(&self, config: &CollectConfig) -> Result<Vec<DatasetEntity>> {
        if self.make.len() != self.model.len() {
            anyhow::bail!(
                "--make and --model must be given in pairs ({} makes, {} models)",
                self.make.len(),
                self.model.len()
            );
        }
        let entities = if self.make.is_empty() {
            entities_from_catalog(&config.catalog)
        } else {
            self.make
                .iter()
                .zip(&self.model)
                .map(|(make, model)| DatasetEntity::new(make, model))
                .collect()
        };
        if entities.is_empty() {
            anyhow::bail!(
                "Nothing to collect: add a [[catalog]] to the config (see config.example.toml) \
                 or pass --make/--model"
            );
        }
        Ok(entities)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let progress = ProgressBar::hidden();
    let mut clog = colog::default_builder();
    clog.filter(
        None,
        if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        },
    );
    let logger = clog.build();
    log::set_max_level(logger.filter());
    log::set_boxed_logger(Box::new(SuspendingLogger::new(Box::new(logger), progress.clone())))?;

    match cli.command {
        Commands::Collect {
            source,
            limit,
            concurrency,
            target_kb,
            algorithm,
            no_seed,
            report,
        } => {
            let mut config = source.load()?;
            if let Some(limit) = limit {
                config.images_per_query = limit;
            }
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if let Some(target_kb) = target_kb {
                config.target_kb = target_kb;
            }
            if let Some(algorithm) = algorithm {
                config.hash_algorithm = algorithm;
            }
            if no_seed {
                config.seed_existing = false;
            }
            let entities = source.entities(&config)?;
            collect(config, &entities, report.as_deref(), &progress)?;
        }

        Commands::Plan { source } => {
            let config = source.load()?;
            config.validate()?;
            let entities = source.entities(&config)?;
            let mut total = 0;
            for entity in &entities {
                println!("▶ {} → {}", entity, entity.final_folder(&config.dataset_root).display());
                for query in plan(entity, &config.orientations, &config.years, &config.exclusions) {
                    println!("   {}", query);
                    total += 1;
                }
            }
            println!("\n{} queries across {} entities", total, entities.len());
        }

        Commands::Audit {
            path,
            config,
            extensions,
            algorithm,
            delete,
        } => {
            let extensions = if extensions.is_empty() {
                CollectConfig::load_or_default(config.as_deref())?.extensions
            } else {
                extensions
            };
            audit(&path, &extensions, algorithm, delete, &progress)?
        }
    }

    Ok(())
}

/// Forwards log records, clearing the progress bar while each one is written.
struct SuspendingLogger {
    inner: Box<dyn log::Log>,
    progress: ProgressBar,
}

impl SuspendingLogger {
    fn new(inner: Box<dyn log::Log>, progress: ProgressBar) -> Self {
        Self { inner, progress }
    }
}

impl log::Log for SuspendingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if self.inner.enabled(record.metadata()) {
            self.progress.suspend(|| self.inner.log(record));
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

fn collect(
    config: CollectConfig,
    entities: &[DatasetEntity],
    report_path: Option<&Path>,
    progress: &ProgressBar,
) -> Result<()> {
    println!(
        "▶ Collecting {} entities into {}",
        entities.len(),
        config.dataset_root.display()
    );

    let fetcher = build_fetcher(&config);
    progress.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg} [{bar:30}] {pos}/{len} queries ({elapsed})")?
            .progress_chars("=> "),
    );
    progress.set_draw_target(ProgressDrawTarget::stderr());
    progress.enable_steady_tick(Duration::from_millis(100));

    let orchestrator = Orchestrator::new(config, fetcher)?.with_progress(progress.clone());
    let scratch_root = orchestrator.config().scratch_root();
    let reports = benchmark("collection", || {
        let reports = orchestrator.run(entities);
        progress.finish_and_clear();
        reports
    });

    // Only succeeds when every per-query directory was cleaned up.
    let _ = fs::remove_dir(&scratch_root);

    for report in &reports {
        print_report(report);
    }
    let accepted: usize = reports.iter().map(|r| r.accepted).sum();
    println!("\n✅ {} images stored across {} entities", accepted, reports.len());

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&reports)?;
        fs::write(path, json).with_context(|| format!("Failed to write report {:?}", path))?;
        println!("📝 Report written to {}", path.display());
    }
    Ok(())
}

fn print_report(report: &EntityReport) {
    if let Some(error) = &report.setup_error {
        println!("\n⚠️  {} {}: skipped ({})", report.make, report.model, error);
        return;
    }
    println!("\n✨ {} {} → {}", report.make, report.model, report.folder.display());
    println!(
        "   queries: {} planned, {} fetched, {} empty, {} failed",
        report.queries_planned, report.queries_fetched, report.queries_empty, report.queries_failed
    );
    println!(
        "   files:   {} seen, {} stored, {} duplicates, {} unreadable, {} move failures",
        report.files_seen, report.accepted, report.duplicates, report.unreadable, report.commit_failures
    );
    println!(
        "   size:    {} already small, {} compressed, {} at quality floor, {} failed",
        report.within_budget, report.compressed, report.floor_reached, report.normalize_failures
    );
    if report.seeded > 0 {
        println!("   seeded {} existing images", report.seeded);
    }
}

fn audit(
    path: &Path,
    extensions: &[String],
    algorithm: HashAlgorithm,
    delete: bool,
    spinner: &ProgressBar,
) -> Result<()> {
    if !path.is_dir() {
        anyhow::bail!("{} is not a directory", path.display());
    }
    println!("▶ Scanning for duplicates in: {}", path.display());

    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Hashing images…");
    spinner.set_draw_target(ProgressDrawTarget::stderr());
    spinner.enable_steady_tick(Duration::from_millis(100));
    let groups = benchmark("hashing all images", || {
        let groups = find_duplicate_groups(path, extensions, algorithm);
        spinner.finish_and_clear();
        groups
    });

    if groups.is_empty() {
        println!("No duplicates found.");
        return Ok(());
    }

    println!("Found {} duplicate group(s):", groups.len());
    let mut deleted = 0;
    for (i, group) in groups.iter().enumerate() {
        println!("\n✨ Group {}:", i + 1);
        println!("   🏆 Keeping → {}", group[0].display());
        for dup in &group[1..] {
            if delete {
                fs::remove_file(dup).with_context(|| format!("Failed to delete {}", dup.display()))?;
                println!("   🗑️  Deleted {}", dup.display());
                deleted += 1;
            } else {
                println!("   ▶ {}", dup.display());
            }
        }
    }

    if delete {
        println!("\n✅ Deleted {} duplicate image(s)", deleted);
    } else {
        println!("\nRe-run with --delete to remove all but the first image of each group.");
    }
    Ok(())
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
