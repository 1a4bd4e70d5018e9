use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions accepted when no list is configured.
pub const DEFAULT_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Recursively walk `dir`, returning image files whose extension is in
/// `extensions` (compared case-insensitively). Unreadable entries are skipped;
/// a missing directory yields an empty list.
pub fn scan_images(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let allowed: Vec<String> = extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_lowercase())
        .collect();

    let mut images = Vec::new();
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if has_allowed_extension(path, &allowed) {
            images.push(path.to_path_buf());
        }
    }
    images.sort();
    images
}

fn has_allowed_extension(path: &Path, allowed: &[String]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

pub fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect()
}
