use serde_json::Value;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use super::{fill_template, FetchFailure, ImageFetcher};
use crate::config::MAX_FETCH_TIMEOUT_SECS;

/// Largest single image accepted from the network.
const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;
const USER_AGENT: &str = concat!("carset/", env!("CARGO_PKG_VERSION"));

/// Fetches from a JSON image-search endpoint, then downloads each result.
///
/// The endpoint template gets `{query}` (URL-encoded) and `{limit}`. The
/// response may be a bare array of URLs or an object whose `value`, `results`
/// or `images` array holds strings or objects with `contentUrl`, `url` or
/// `image` fields.
pub struct HttpFetcher {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<(String, String)>,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(20))
            .user_agent(USER_AGENT)
            .build();

        Self {
            agent,
            endpoint: endpoint.to_string(),
            api_key: None,
            timeout,
        }
    }

    pub fn with_api_key(mut self, header: &str, key: &str) -> Self {
        self.api_key = Some((header.to_string(), key.to_string()));
        self
    }

    fn search(&self, query: &str, limit: usize, deadline: Instant) -> Result<Vec<String>, FetchFailure> {
        let encoded = urlencoding::encode(query);
        let limit = limit.to_string();
        let url = fill_template(
            &self.endpoint,
            &[("query", encoded.as_ref()), ("limit", limit.as_str())],
        );

        let mut request = self.agent.get(&url).timeout(remaining(deadline, self.timeout)?);
        if let Some((header, key)) = &self.api_key {
            request = request.set(header, key);
        }

        let response = request.call().map_err(|e| self.classify(e))?;
        let body: Value = response
            .into_json()
            .map_err(|e| FetchFailure::Backend(format!("search response parse failed: {}", e)))?;
        Ok(extract_image_urls(&body))
    }

    fn download(&self, url: &str, deadline: Instant) -> Result<Vec<u8>, String> {
        let timeout = remaining(deadline, self.timeout).map_err(|e| e.to_string())?;
        let response = self
            .agent
            .get(url)
            .timeout(timeout)
            .call()
            .map_err(|e| format!("request failed: {}", e))?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_IMAGE_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|e| format!("read failed: {}", e))?;
        if bytes.is_empty() {
            return Err("empty response".to_string());
        }
        Ok(bytes)
    }

    fn classify(&self, error: ureq::Error) -> FetchFailure {
        match error {
            ureq::Error::Status(code, _) => {
                FetchFailure::Network(format!("search endpoint returned HTTP {}", code))
            }
            ureq::Error::Transport(transport) => {
                let message = transport.to_string();
                if message.to_ascii_lowercase().contains("timed out") {
                    FetchFailure::Timeout(self.timeout)
                } else {
                    FetchFailure::Network(message)
                }
            }
        }
    }
}

impl ImageFetcher for HttpFetcher {
    fn fetch(&self, query: &str, limit: usize, output_dir: &Path) -> Result<usize, FetchFailure> {
        let deadline = deadline_after(self.timeout);
        let mut urls = self.search(query, limit, deadline)?;
        urls.truncate(limit);
        if urls.is_empty() {
            return Ok(0);
        }

        fs::create_dir_all(output_dir)?;
        let mut written = 0;
        for url in &urls {
            if Instant::now() >= deadline {
                log::warn!(
                    "Fetch deadline reached for '{}' after {} of {} images",
                    query,
                    written,
                    urls.len()
                );
                break;
            }
            let bytes = match self.download(url, deadline) {
                Ok(bytes) => bytes,
                Err(reason) => {
                    log::debug!("Skipping {}: {}", url, reason);
                    continue;
                }
            };

            let name = format!("Image_{}.{}", written + 1, extension_for(&bytes, url));
            if let Err(e) = fs::write(output_dir.join(&name), &bytes) {
                log::warn!("Failed to write {}: {}", name, e);
                continue;
            }
            written += 1;
        }

        Ok(written)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// `now + timeout`, clamped so an oversized timeout cannot overflow `Instant`.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    let timeout = timeout.min(Duration::from_secs(MAX_FETCH_TIMEOUT_SECS));
    now.checked_add(timeout).unwrap_or(now)
}

fn remaining(deadline: Instant, timeout: Duration) -> Result<Duration, FetchFailure> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
        .ok_or(FetchFailure::Timeout(timeout))
}

/// Pull image URLs out of the common search-response shapes.
pub fn extract_image_urls(body: &Value) -> Vec<String> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(map) => match ["value", "results", "images"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
        {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(url) => Some(url.as_str()),
            Value::Object(fields) => ["contentUrl", "url", "image"]
                .iter()
                .find_map(|key| fields.get(*key).and_then(Value::as_str)),
            _ => None,
        })
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .map(str::to_string)
        .collect()
}

/// File extension from the content, then the URL path, then `jpg`.
///
/// Content that is not an image is still written; the dedup gate rejects it.
pub fn extension_for(bytes: &[u8], url: &str) -> String {
    if let Some(ext) = image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first())
    {
        return ext.to_string();
    }

    let path = url.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "jpg".to_string())
}
