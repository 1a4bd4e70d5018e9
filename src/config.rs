use clap::ValueEnum;
use image_hasher::HashAlg;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::entity::CatalogEntry;

/// Longest per-query fetch timeout accepted from config.
pub const MAX_FETCH_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Perceptual hash used as the dedup key. One algorithm per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// Average hash: each bit is pixel > mean of the downscaled image
    #[default]
    Mean,
    Median,
    /// Difference hash: each bit compares horizontally adjacent pixels
    Gradient,
    DoubleGradient,
    Blockhash,
}

impl HashAlgorithm {
    pub fn to_hash_alg(self) -> HashAlg {
        match self {
            HashAlgorithm::Mean => HashAlg::Mean,
            HashAlgorithm::Median => HashAlg::Median,
            HashAlgorithm::Gradient => HashAlg::Gradient,
            HashAlgorithm::DoubleGradient => HashAlg::DoubleGradient,
            HashAlgorithm::Blockhash => HashAlg::Blockhash,
        }
    }
}

/// Which fetch backend `collect` wires into the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetcherConfig {
    /// External downloader program. `{query}`, `{limit}` and `{output}` are
    /// substituted in each argument.
    Command { program: String, args: Vec<String> },
    /// JSON image-search endpoint. `{query}` and `{limit}` are substituted in
    /// the URL; the key, if any, is read from `api_key_env`.
    Http {
        endpoint: String,
        #[serde(default)]
        api_key_header: Option<String>,
        #[serde(default)]
        api_key_env: Option<String>,
    },
}

impl Default for FetcherConfig {
    fn default() -> Self {
        FetcherConfig::Command {
            program: "bing-image-downloader".to_string(),
            args: vec![
                "--query".to_string(),
                "{query}".to_string(),
                "--limit".to_string(),
                "{limit}".to_string(),
                "--output".to_string(),
                "{output}".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    pub dataset_root: PathBuf,
    /// Parent of the per-query scratch directories. Defaults to
    /// `<dataset_root>/.scratch` when unset.
    pub scratch_root: Option<PathBuf>,
    pub orientations: Vec<String>,
    pub years: Vec<u16>,
    pub exclusions: Vec<String>,
    pub images_per_query: usize,
    pub concurrency: usize,
    pub hash_algorithm: HashAlgorithm,
    pub seed_existing: bool,
    pub target_kb: u64,
    pub tolerance_kb: u64,
    pub initial_quality: u8,
    pub quality_step: u8,
    pub min_quality: u8,
    pub fetch_timeout_secs: u64,
    pub fetch_retries: u32,
    pub pace_min_ms: u64,
    pub pace_max_ms: u64,
    pub extensions: Vec<String>,
    pub fetcher: FetcherConfig,
    pub catalog: Vec<CatalogEntry>,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            dataset_root: PathBuf::from("scraped_dataset"),
            scratch_root: None,
            orientations: vec!["front".into(), "side".into(), "back".into()],
            years: vec![2016, 2018, 2020, 2022, 2024, 2025],
            exclusions: vec!["sidemirror".into(), "accessories".into(), "interior".into()],
            images_per_query: 40,
            concurrency: 4,
            hash_algorithm: HashAlgorithm::Mean,
            seed_existing: true,
            target_kb: 100,
            tolerance_kb: 0,
            initial_quality: 85,
            quality_step: 5,
            min_quality: 10,
            fetch_timeout_secs: 60,
            fetch_retries: 0,
            pace_min_ms: 0,
            pace_max_ms: 0,
            extensions: crate::scan::default_extensions(),
            fetcher: FetcherConfig::default(),
            catalog: Vec::new(),
        }
    }
}

impl CollectConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load `path` if given, else the default config file if it exists, else
    /// built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => {
                    log::info!("Using config {}", path.display());
                    Self::load(&path)
                }
                None => Ok(Self::default()),
            },
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// `$XDG_CONFIG_HOME/carset/config.toml` (or the platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("carset").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };

        if self.orientations.is_empty() {
            return invalid("at least one orientation is required");
        }
        if self.years.is_empty() {
            return invalid("at least one year is required");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.images_per_query == 0 {
            return invalid("images_per_query must be at least 1");
        }
        if self.target_kb == 0 {
            return invalid("target_kb must be at least 1");
        }
        if self.quality_step == 0 {
            return invalid("quality_step must be at least 1");
        }
        if self.min_quality == 0 || self.initial_quality > 100 {
            return invalid("JPEG quality must be within 1..=100");
        }
        if self.min_quality > self.initial_quality {
            return invalid("min_quality cannot exceed initial_quality");
        }
        if self.fetch_timeout_secs == 0 || self.fetch_timeout_secs > MAX_FETCH_TIMEOUT_SECS {
            return Err(ConfigError::Invalid {
                message: format!(
                    "fetch_timeout_secs must be within 1..={}",
                    MAX_FETCH_TIMEOUT_SECS
                ),
            });
        }
        if self.pace_min_ms > self.pace_max_ms {
            return invalid("pace_min_ms cannot exceed pace_max_ms");
        }
        if self.extensions.is_empty() {
            return invalid("at least one image extension is required");
        }
        Ok(())
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root
            .clone()
            .unwrap_or_else(|| self.dataset_root.join(".scratch"))
    }

    pub fn target_bytes(&self) -> u64 {
        self.target_kb * 1024
    }

    pub fn tolerance_bytes(&self) -> u64 {
        self.tolerance_kb * 1024
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
