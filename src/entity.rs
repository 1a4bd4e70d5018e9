use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// One make with the models to collect for it, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub make: String,
    pub models: Vec<String>,
}

/// A (make, model) pair. Owns one dataset folder and one dedup scope.
///
/// The display forms are kept as given because they go into search text;
/// folder naming always goes through the lowercased forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetEntity {
    pub make: String,
    pub model: String,
}

impl DatasetEntity {
    pub fn new(make: &str, model: &str) -> Self {
        Self {
            make: make.trim().to_string(),
            model: model.trim().to_string(),
        }
    }

    pub fn make_key(&self) -> String {
        self.make.to_lowercase()
    }

    pub fn model_key(&self) -> String {
        self.model.to_lowercase()
    }

    /// `<make_lower>_<model_lower>`, the folder name downstream consumers rely on.
    pub fn folder_name(&self) -> String {
        format!("{}_{}", self.make_key(), self.model_key())
    }

    pub fn final_folder(&self, dataset_root: &Path) -> PathBuf {
        dataset_root.join(self.folder_name())
    }

    /// Filesystem-safe tag for scratch directory prefixes.
    pub fn scratch_tag(&self) -> String {
        self.folder_name()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }
}

impl fmt::Display for DatasetEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.make, self.model)
    }
}

/// Expand a catalog into entities, dropping blank names and case-insensitive
/// repeats so two spellings of one model never get two indexes.
pub fn entities_from_catalog(catalog: &[CatalogEntry]) -> Vec<DatasetEntity> {
    let mut seen = std::collections::HashSet::new();
    let mut entities = Vec::new();

    for entry in catalog {
        if entry.make.trim().is_empty() {
            log::warn!("Skipping catalog entry with an empty make");
            continue;
        }
        for model in &entry.models {
            if model.trim().is_empty() {
                continue;
            }
            let entity = DatasetEntity::new(&entry.make, model);
            if seen.insert(entity.folder_name()) {
                entities.push(entity);
            }
        }
    }

    entities
}
