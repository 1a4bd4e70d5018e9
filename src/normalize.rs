use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::dedup::decode_image;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decode failed: {0}")]
    Decode(image::ImageError),

    #[error("JPEG encode failed at quality {quality}: {source}")]
    Encode {
        quality: u8,
        #[source]
        source: image::ImageError,
    },
}

/// What happened to a file handed to [`SizeNormalizer::normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NormalizeOutcome {
    /// Already within budget; the file was not touched.
    WithinBudget { bytes: u64 },
    /// Re-encoded at `quality`, which met the budget.
    Compressed { quality: u8, bytes: u64 },
    /// Even the quality floor could not meet the budget; the floor encoding was kept.
    FloorReached { quality: u8, bytes: u64 },
    /// Decode, encode or IO failure; the file was left as it was.
    Failed { reason: String },
}

/// Shrinks images in place by re-encoding them as JPEG at falling quality.
#[derive(Debug, Clone)]
pub struct SizeNormalizer {
    target_bytes: u64,
    tolerance_bytes: u64,
    initial_quality: u8,
    quality_step: u8,
    min_quality: u8,
}

impl SizeNormalizer {
    pub fn new(target_bytes: u64) -> Self {
        Self {
            target_bytes,
            tolerance_bytes: 0,
            initial_quality: 85,
            quality_step: 5,
            min_quality: 10,
        }
    }

    pub fn with_tolerance(mut self, tolerance_bytes: u64) -> Self {
        self.tolerance_bytes = tolerance_bytes;
        self
    }

    /// Quality ladder: start at `initial`, step down by `step`, stop at `floor`.
    pub fn with_quality(mut self, initial: u8, step: u8, floor: u8) -> Self {
        self.initial_quality = initial.clamp(1, 100);
        self.quality_step = step.max(1);
        self.min_quality = floor.clamp(1, self.initial_quality);
        self
    }

    pub fn target_bytes(&self) -> u64 {
        self.target_bytes
    }

    pub fn min_quality(&self) -> u8 {
        self.min_quality
    }

    /// Bring `path` under the byte budget. Never fails: problems are logged
    /// and reported as [`NormalizeOutcome::Failed`] with the file unchanged.
    pub fn normalize(&self, path: &Path) -> NormalizeOutcome {
        match self.try_normalize(path) {
            Ok(outcome) => {
                match &outcome {
                    NormalizeOutcome::Compressed { quality, bytes } => log::debug!(
                        "Compressed {} to {:.2} KB with quality={}",
                        path.display(),
                        *bytes as f64 / 1024.0,
                        quality
                    ),
                    NormalizeOutcome::FloorReached { bytes, .. } => log::info!(
                        "Could not compress {} under {} KB; minimum quality reached ({:.2} KB)",
                        path.display(),
                        self.target_bytes / 1024,
                        *bytes as f64 / 1024.0
                    ),
                    _ => {}
                }
                outcome
            }
            Err(e) => {
                log::warn!("Error compressing image {}: {}", path.display(), e);
                NormalizeOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn try_normalize(&self, path: &Path) -> Result<NormalizeOutcome, NormalizeError> {
        let original_bytes = fs::metadata(path)?.len();
        if self.within_budget(original_bytes) {
            return Ok(NormalizeOutcome::WithinBudget {
                bytes: original_bytes,
            });
        }

        let img = decode_image(path).map_err(NormalizeError::Decode)?;
        // JPEG has no alpha or palette; flatten to plain RGB first.
        let rgb = DynamicImage::ImageRgb8(img.to_rgb8());

        let mut quality = self.initial_quality;
        loop {
            let encoded = encode_jpeg(&rgb, quality)?;
            let bytes = encoded.len() as u64;

            if self.within_budget(bytes) {
                write_replacing(path, &encoded)?;
                return Ok(NormalizeOutcome::Compressed { quality, bytes });
            }

            match quality.checked_sub(self.quality_step) {
                Some(next) if next >= self.min_quality => quality = next,
                _ => {
                    write_replacing(path, &encoded)?;
                    return Ok(NormalizeOutcome::FloorReached { quality, bytes });
                }
            }
        }
    }

    fn within_budget(&self, bytes: u64) -> bool {
        bytes <= self.target_bytes.saturating_add(self.tolerance_bytes)
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, NormalizeError> {
    let mut encoded = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut encoded, quality);
    img.write_with_encoder(encoder)
        .map_err(|source| NormalizeError::Encode { quality, source })?;
    Ok(encoded)
}

/// Write to a sibling temp file, then rename over `path`, so a crash never
/// leaves a half-written image behind.
fn write_replacing(path: &Path, bytes: &[u8]) -> Result<(), NormalizeError> {
    let temp_path = temp_sibling(path);
    if let Err(e) = fs::write(&temp_path, bytes).and_then(|_| fs::rename(&temp_path, path)) {
        let _ = fs::remove_file(&temp_path);
        return Err(NormalizeError::Io(e));
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}
