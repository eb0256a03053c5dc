use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::HarvestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Order,
    Family,
    Genus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSources {
    pub genus: Vec<PathBuf>,
    pub family: Vec<PathBuf>,
    pub order: Vec<PathBuf>,
    pub common_words: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceTables {
    genus: HashSet<String>,
    family: HashSet<String>,
    order: HashSet<String>,
    common_words: HashSet<String>,
}

impl ReferenceTables {
    pub fn new<G, F, O, W>(genus: G, family: F, order: O, common_words: W) -> Self
    where
        G: IntoIterator,
        G::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
        W: IntoIterator,
        W::Item: AsRef<str>,
    {
        Self {
            genus: genus.into_iter().map(Into::into).collect(),
            family: family.into_iter().map(Into::into).collect(),
            order: order.into_iter().map(Into::into).collect(),
            common_words: common_words
                .into_iter()
                .map(|word| capitalize(word.as_ref()))
                .collect(),
        }
    }

    pub fn load(sources: &ReferenceSources) -> Result<Self, HarvestError> {
        let genus = read_names(&sources.genus)?;
        let family = read_names(&sources.family)?;
        let order = read_names(&sources.order)?;
        let common_words = read_names(&sources.common_words)?;
        debug!(
            genus = genus.len(),
            family = family.len(),
            order = order.len(),
            common_words = common_words.len(),
            "reference tables loaded"
        );
        Ok(Self::new(genus, family, order, common_words))
    }

    pub fn names(&self, rank: Rank) -> &HashSet<String> {
        match rank {
            Rank::Order => &self.order,
            Rank::Family => &self.family,
            Rank::Genus => &self.genus,
        }
    }

    pub fn is_genus(&self, name: &str) -> bool {
        self.genus.contains(name)
    }

    pub fn is_common_word(&self, word: &str) -> bool {
        self.common_words.contains(word)
    }
}

pub fn parse_names(content: &str) -> Vec<String> {
    content
        .split([',', '\n', '\r'])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_names(paths: &[PathBuf]) -> Result<Vec<String>, HarvestError> {
    let mut names = Vec::new();
    for path in paths {
        names.extend(parse_names(&read_table(path)?));
    }
    Ok(names)
}

fn read_table(path: &Path) -> Result<String, HarvestError> {
    fs::read_to_string(path).map_err(|_| HarvestError::ReferenceRead(path.to_path_buf()))
}

fn capitalize(word: &str) -> String {
    let lower = word.trim().to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_names_accepts_commas_and_lines() {
        let names = parse_names("Quercus,Rosa\nFagus,\r\n , Acer\n");
        assert_eq!(names, vec!["Quercus", "Rosa", "Fagus", "Acer"]);
    }

    #[test]
    fn common_words_are_capitalized() {
        let tables = ReferenceTables::new(
            ["Quercus"],
            Vec::<String>::new(),
            Vec::<String>::new(),
            ["the", "SPECIES", "phylogeny"],
        );
        assert!(tables.is_common_word("The"));
        assert!(tables.is_common_word("Species"));
        assert!(!tables.is_common_word("the"));
        assert!(tables.is_genus("Quercus"));
    }

    #[test]
    fn load_merges_files_per_rank() {
        let temp = tempfile::tempdir().unwrap();
        let write = |name: &str, content: &str| {
            let path = temp.path().join(name);
            fs::write(&path, content).unwrap();
            path
        };
        let sources = ReferenceSources {
            genus: vec![write("genus.csv", "Quercus,Rosa")],
            family: vec![
                write("plant_families.csv", "Rosaceae"),
                write("other_families.csv", "Hominidae"),
            ],
            order: vec![write("orders.csv", "Fagales")],
            common_words: vec![write("words.txt", "the,of,and")],
        };
        let tables = ReferenceTables::load(&sources).unwrap();
        assert_eq!(tables.names(Rank::Family).len(), 2);
        assert!(tables.names(Rank::Order).contains("Fagales"));
        assert!(tables.is_common_word("Of"));
    }

    #[test]
    fn load_reports_missing_file() {
        let sources = ReferenceSources {
            genus: vec![PathBuf::from("/nonexistent/genus.csv")],
            family: Vec::new(),
            order: Vec::new(),
            common_words: Vec::new(),
        };
        assert_matches!(
            ReferenceTables::load(&sources),
            Err(HarvestError::ReferenceRead(_))
        );
    }
}
