//! The fetch boundary: anything that can turn a search query into image files
//! in a directory.

pub mod command;
pub mod http;

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::config::{CollectConfig, FetcherConfig};

pub use command::CommandFetcher;
pub use http::HttpFetcher;

/// Adapter-level fault. "No results" is not a failure; it is `Ok(0)`.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait ImageFetcher: Send + Sync {
    /// Download up to `limit` candidate images for `query` into `output_dir`
    /// (subdirectories allowed). Returns how many files were written.
    fn fetch(&self, query: &str, limit: usize, output_dir: &Path) -> Result<usize, FetchFailure>;

    /// Short label for logs.
    fn name(&self) -> &str;
}

/// Build the backend selected in `config`.
pub fn build_fetcher(config: &CollectConfig) -> Box<dyn ImageFetcher> {
    match &config.fetcher {
        FetcherConfig::Command { program, args } => Box::new(
            CommandFetcher::new(program, args.clone(), config.fetch_timeout())
                .with_extensions(config.extensions.clone()),
        ),
        FetcherConfig::Http {
            endpoint,
            api_key_header,
            api_key_env,
        } => {
            let api_key = api_key_env.as_ref().and_then(|var| match std::env::var(var) {
                Ok(value) if !value.is_empty() => Some(value),
                _ => {
                    log::warn!("API key variable {} is not set; sending unauthenticated requests", var);
                    None
                }
            });
            let mut fetcher = HttpFetcher::new(endpoint, config.fetch_timeout());
            if let (Some(header), Some(key)) = (api_key_header, api_key) {
                fetcher = fetcher.with_api_key(header, &key);
            }
            Box::new(fetcher)
        }
    }
}

/// Replace `{name}` placeholders in `template`.
pub(crate) fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}
