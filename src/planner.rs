use serde::Serialize;
use std::fmt;

use crate::entity::DatasetEntity;

/// One search to issue: an entity seen from one orientation in one model year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryDescriptor {
    pub entity: DatasetEntity,
    pub orientation: String,
    pub year: u16,
    pub exclusions: Vec<String>,
}

impl QueryDescriptor {
    /// Search text, e.g. `Toyota Vios 2020 front view car -toy -drawing`.
    pub fn render(&self) -> String {
        let mut query = format!(
            "{} {} {} {} view car",
            self.entity.make, self.entity.model, self.year, self.orientation
        );
        for term in &self.exclusions {
            let term = term.trim().trim_start_matches('-');
            if !term.is_empty() {
                query.push_str(" -");
                query.push_str(term);
            }
        }
        query
    }

    /// Filename prefix for images committed from this query.
    pub fn file_prefix(&self) -> String {
        format!("{}_{}", self.orientation, self.year)
    }
}

impl fmt::Display for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Every (orientation, year) pair for `entity`, orientation-major, years in
/// the order given.
pub fn plan(
    entity: &DatasetEntity,
    orientations: &[String],
    years: &[u16],
    exclusions: &[String],
) -> Vec<QueryDescriptor> {
    orientations
        .iter()
        .flat_map(|orientation| {
            years.iter().map(move |&year| QueryDescriptor {
                entity: entity.clone(),
                orientation: orientation.clone(),
                year,
                exclusions: exclusions.to_vec(),
            })
        })
        .collect()
}
