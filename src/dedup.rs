//! Perceptual-hash deduplication.
//!
//! A [`DedupIndex`] belongs to exactly one dataset entity. It maps the base64
//! form of a perceptual hash to the path of the first image that produced it.
//! Matching is exact: two images whose hashes differ by a single bit are both
//! admitted.

use image::{DynamicImage, ImageReader};
use image_hasher::{Hasher, HasherConfig};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::config::HashAlgorithm;
use crate::scan::scan_images;

/// Result of offering one candidate file to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupVerdict {
    /// First image with this hash; the entry is now registered.
    Unique { hash: String },
    /// An image with the same hash was registered earlier.
    Duplicate { first_seen: PathBuf },
    /// The file could not be decoded. The index is unchanged.
    Unreadable { reason: String },
}

impl DedupVerdict {
    pub fn is_unique(&self) -> bool {
        matches!(self, DedupVerdict::Unique { .. })
    }
}

/// Computes perceptual hashes with one fixed algorithm.
pub struct PerceptualHasher {
    hasher: Hasher,
    algorithm: HashAlgorithm,
}

impl PerceptualHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let hasher = HasherConfig::new()
            .hash_alg(algorithm.to_hash_alg())
            .hash_size(8, 8)
            .to_hasher();
        Self { hasher, algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Decode `path` (format sniffed from content, not the extension) and hash it.
    pub fn hash_file(&self, path: &Path) -> Result<String, image::ImageError> {
        let img = decode_image(path)?;
        Ok(self.hash_image(&img))
    }

    pub fn hash_image(&self, img: &DynamicImage) -> String {
        self.hasher.hash_image(img).to_base64()
    }
}

pub(crate) fn decode_image(path: &Path) -> Result<DynamicImage, image::ImageError> {
    ImageReader::open(path)?.with_guessed_format()?.decode()
}

pub struct DedupIndex {
    hasher: PerceptualHasher,
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl DedupIndex {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            hasher: PerceptualHasher::new(algorithm),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Hash `path` and register it unless its hash is already present.
    ///
    /// Hashing runs outside the lock; lookup and insert happen under one lock
    /// acquisition, so of several concurrent candidates with the same hash
    /// exactly one is reported `Unique`.
    pub fn check_and_register(&self, path: &Path) -> DedupVerdict {
        let hash = match self.hasher.hash_file(path) {
            Ok(hash) => hash,
            Err(e) => {
                log::warn!("Error hashing image {}: {}", path.display(), e);
                return DedupVerdict::Unreadable {
                    reason: e.to_string(),
                };
            }
        };

        let mut entries = self.lock();
        if let Some(first_seen) = entries.get(&hash) {
            return DedupVerdict::Duplicate {
                first_seen: first_seen.clone(),
            };
        }
        entries.insert(hash.clone(), path.to_path_buf());
        DedupVerdict::Unique { hash }
    }

    /// Point an existing entry at the path its image was committed to.
    pub fn relocate(&self, hash: &str, new_path: &Path) {
        if let Some(path) = self.lock().get_mut(hash) {
            *path = new_path.to_path_buf();
        }
    }

    /// Drop an entry whose image never made it into the dataset.
    pub fn forget(&self, hash: &str) -> Option<PathBuf> {
        self.lock().remove(hash)
    }

    /// Register every decodable image already in `dir`. Returns how many
    /// distinct hashes were added. Existing duplicates inside `dir` are left
    /// on disk; only the first one seen is recorded.
    pub fn seed_from_dir(&self, dir: &Path, extensions: &[String]) -> usize {
        let files = scan_images(dir, extensions);
        let hashed: Vec<(String, PathBuf)> = files
            .par_iter()
            .filter_map(|path| match self.hasher.hash_file(path) {
                Ok(hash) => Some((hash, path.clone())),
                Err(e) => {
                    log::warn!("Skipping unreadable existing image {}: {}", path.display(), e);
                    None
                }
            })
            .collect();

        let mut entries = self.lock();
        let before = entries.len();
        for (hash, path) in hashed {
            entries.entry(hash).or_insert(path);
        }
        entries.len() - before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.hasher.algorithm()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        // A routing task that panicked mid-insert leaves the map consistent,
        // so a poisoned lock is still usable.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Find groups of images under `dir` that share a perceptual hash.
///
/// Each group is ordered oldest first (creation time, falling back to path
/// order), so `group[0]` is the natural one to keep.
pub fn find_duplicate_groups(
    dir: &Path,
    extensions: &[String],
    algorithm: HashAlgorithm,
) -> Vec<Vec<PathBuf>> {
    let images = scan_images(dir, extensions);
    let hasher = PerceptualHasher::new(algorithm);

    let key_paths: Vec<(String, PathBuf)> = images
        .par_iter()
        .filter_map(|path| match hasher.hash_file(path) {
            Ok(key) => Some((key, path.clone())),
            Err(e) => {
                log::warn!("Failed to decode {}: {}", path.display(), e);
                None
            }
        })
        .collect();

    let mut map: HashMap<String, Vec<PathBuf>> = HashMap::new();
    for (key, path) in key_paths {
        map.entry(key).or_default().push(path);
    }

    let mut groups: Vec<Vec<PathBuf>> = map.into_values().filter(|v| v.len() > 1).collect();
    for group in &mut groups {
        group.sort_by(|a, b| get_timestamp(a).cmp(&get_timestamp(b)).then_with(|| a.cmp(b)));
    }
    groups.sort();
    groups
}

/// Creation time (or modification time) of a file, UNIX_EPOCH on error.
fn get_timestamp(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.created().or_else(|_| m.modified()))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[cfg(test)]
pub(crate) mod test_images {
    use image::{ImageBuffer, Rgb};
    use std::path::Path;

    /// Left half dark, right half light.
    pub fn split_vertical(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, _| {
            let v = if x < width / 2 { 20u8 } else { 230u8 };
            Rgb([v, v, v])
        });
        img.save(path).unwrap();
    }

    /// Top half dark, bottom half light.
    pub fn split_horizontal(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |_, y| {
            let v = if y < height / 2 { 20u8 } else { 230u8 };
            Rgb([v, v, v])
        });
        img.save(path).unwrap();
    }

    /// Dark quadrants on the main diagonal.
    pub fn checker(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let v = if (x < width / 2) == (y < height / 2) { 20u8 } else { 230u8 };
            Rgb([v, v, v])
        });
        img.save(path).unwrap();
    }

    /// Pseudo-random pixels; compresses badly, used to exceed size budgets.
    pub fn noise(path: &Path, width: u32, height: u32, seed: u32) {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        let img = ImageBuffer::from_fn(width, height, |_, _| {
            let mut next = || {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state & 0xff) as u8
            };
            Rgb([next(), next(), next()])
        });
        img.save(path).unwrap();
    }
}
