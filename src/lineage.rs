use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::domain::{AssignType, Lineage, PaperRecord};
use crate::error::HarvestError;
use crate::taxonomy::{Rank, ReferenceTables};
use crate::tree_format::{self, TreeSchema};

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\W+").expect("non-word pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankPriority([Rank; 3]);

impl RankPriority {
    pub const ORDER_FIRST: Self = Self([Rank::Order, Rank::Family, Rank::Genus]);
    pub const GENUS_FIRST: Self = Self([Rank::Genus, Rank::Family, Rank::Order]);

    pub fn new(ranks: &[Rank]) -> Result<Self, HarvestError> {
        let [first, second, third] = ranks else {
            return Err(HarvestError::InvalidConfig(format!(
                "lineage priority needs exactly 3 ranks, got {}",
                ranks.len()
            )));
        };
        if first == second || first == third || second == third {
            return Err(HarvestError::InvalidConfig(
                "lineage priority repeats a rank".to_string(),
            ));
        }
        Ok(Self([*first, *second, *third]))
    }

    pub fn ranks(&self) -> &[Rank; 3] {
        &self.0
    }
}

impl Default for RankPriority {
    fn default() -> Self {
        Self::ORDER_FIRST
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapRule {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathRemap {
    rules: Vec<RemapRule>,
}

impl PathRemap {
    pub fn new(rules: Vec<RemapRule>) -> Self {
        Self { rules }
    }

    pub fn apply(&self, path: &Utf8Path) -> Utf8PathBuf {
        for rule in &self.rules {
            if let Some(rest) = path.as_str().strip_prefix(rule.from.as_str()) {
                let remapped = Utf8PathBuf::from(format!("{}{}", rule.to, rest));
                debug!(from = %path, to = %remapped, "remapped tree path");
                return remapped;
            }
        }
        path.to_path_buf()
    }
}

// Text wins a conflict, flagged as `by_text_bad`.
pub fn combine_evidence(text_taxon: Option<String>, tree_taxon: Option<String>) -> Lineage {
    let (taxon, assign_type) = match (text_taxon, tree_taxon) {
        (None, None) => (String::new(), AssignType::Fail),
        (Some(text), None) => (text, AssignType::ByText),
        (None, Some(tree)) => (tree, AssignType::ByTree),
        (Some(text), Some(tree)) if text == tree => (text, AssignType::Both),
        (Some(text), Some(_)) => (text, AssignType::ByTextBad),
    };
    Lineage { taxon, assign_type }
}

pub struct LineageAssigner<'a> {
    tables: &'a ReferenceTables,
    priority: RankPriority,
    remap: PathRemap,
}

impl<'a> LineageAssigner<'a> {
    pub fn new(tables: &'a ReferenceTables) -> Self {
        Self {
            tables,
            priority: RankPriority::default(),
            remap: PathRemap::default(),
        }
    }

    pub fn with_priority(mut self, priority: RankPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_remap(mut self, remap: PathRemap) -> Self {
        self.remap = remap;
        self
    }

    pub fn assign(&self, record: &PaperRecord) -> Lineage {
        let text_taxon = self.text_taxon(record);
        let tree_taxon = self.tree_taxon(record);
        debug!(doi = %record.doi, ?text_taxon, ?tree_taxon, "lineage evidence");
        let lineage = combine_evidence(text_taxon, tree_taxon);
        if lineage.assign_type == AssignType::Fail {
            error!(doi = %record.doi, "cannot assign taxon");
        } else {
            info!(
                doi = %record.doi,
                lineage = %lineage.taxon,
                assign_type = %lineage.assign_type,
                "assigned lineage"
            );
        }
        lineage
    }

    pub fn assign_in_place(&self, record: &mut PaperRecord) {
        let lineage = self.assign(record);
        record.apply(lineage);
    }

    pub fn candidate_words(&self, record: &PaperRecord) -> HashSet<String> {
        [record.title.as_str(), record.abstract_text.as_str()]
            .into_iter()
            .flat_map(|content| NON_WORD.split(content))
            .filter(|word| word.chars().count() > 1)
            .filter(|word| word.chars().next().map(char::is_uppercase).unwrap_or(false))
            .filter(|word| !self.tables.is_common_word(word))
            .map(str::to_string)
            .collect()
    }

    pub fn text_taxon(&self, record: &PaperRecord) -> Option<String> {
        let words = self.candidate_words(record);
        self.priority.ranks().iter().find_map(|rank| {
            let names = self.tables.names(*rank);
            words.iter().find(|word| names.contains(*word)).cloned()
        })
    }

    pub fn tree_taxon(&self, record: &PaperRecord) -> Option<String> {
        for stored in record.tree_files() {
            let path = self.remap.apply(stored);
            if !path.as_std_path().exists() {
                warn!(%path, "tree file not found");
                continue;
            }
            let content = match fs::read(path.as_std_path()) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => {
                    warn!(%path, %err, "tree file unreadable");
                    continue;
                }
            };
            let schema = TreeSchema::sniff(content.lines().next().unwrap_or_default());
            let document = match tree_format::parse(&content, schema) {
                Ok(document) => document,
                Err(err) => {
                    warn!(%path, %schema, %err, "invalid tree format");
                    continue;
                }
            };
            if let Some(genus) = self.genus_from_labels(&document.taxon_labels()) {
                debug!(%path, %genus, "tree taxon");
                return Some(genus);
            }
        }
        None
    }

    pub fn genus_from_labels(&self, labels: &[String]) -> Option<String> {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        let mut slots: HashMap<&str, usize> = HashMap::new();
        for token in labels
            .iter()
            .flat_map(|label| label.split(|ch: char| ch == '_' || ch.is_whitespace()))
            .filter(|token| self.tables.is_genus(token))
        {
            match slots.get(token) {
                Some(&slot) => counts[slot].1 += 1,
                None => {
                    slots.insert(token, counts.len());
                    counts.push((token, 1));
                }
            }
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        counts.first().map(|(genus, count)| {
            debug!(genus, count, "majority genus");
            genus.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn tables() -> ReferenceTables {
        ReferenceTables::new(
            ["Quercus", "Rosa", "Fagus", "Betula"],
            ["Rosaceae", "Fagaceae"],
            ["Fagales", "Rosales"],
            ["the", "of", "phylogeny", "species"],
        )
    }

    fn record(title: &str, abstract_text: &str) -> PaperRecord {
        let mut record = PaperRecord::new("10.1/test");
        record.title = title.to_string();
        record.abstract_text = abstract_text.to_string();
        record
    }

    #[test]
    fn combine_truth_table() {
        let some = |s: &str| Some(s.to_string());
        let cases = [
            (some("Rosa"), None, "Rosa", AssignType::ByText),
            (None, some("Quercus"), "Quercus", AssignType::ByTree),
            (some("Rosa"), some("Rosa"), "Rosa", AssignType::Both),
            (some("Rosa"), some("Quercus"), "Rosa", AssignType::ByTextBad),
            (None, None, "", AssignType::Fail),
        ];
        for (text, tree, taxon, assign_type) in cases {
            let lineage = combine_evidence(text, tree);
            assert_eq!(lineage.taxon, taxon);
            assert_eq!(lineage.assign_type, assign_type);
        }
    }

    #[test]
    fn candidate_words_filter() {
        let tables = tables();
        let assigner = LineageAssigner::new(&tables);
        let words = assigner.candidate_words(&record(
            "Phylogeny of Quercus species",
            "The genus Quercus (oaks), A test; DNA-barcoding in rosa.",
        ));
        assert!(words.contains("Quercus"));
        assert!(words.contains("DNA"));
        assert!(!words.contains("Phylogeny"));
        assert!(!words.contains("The"));
        assert!(!words.contains("A"));
        assert!(!words.contains("rosa"));
    }

    #[test]
    fn text_taxon_resolves_genus() {
        let tables = tables();
        let assigner = LineageAssigner::new(&tables);
        let record = record("Phylogeny of Quercus species", "Quercus is a genus of oaks.");
        assert_eq!(assigner.text_taxon(&record).as_deref(), Some("Quercus"));
    }

    #[test]
    fn text_priority_is_configurable() {
        let tables = tables();
        let record = record("Quercus in the Fagales", "");
        let order_first = LineageAssigner::new(&tables);
        assert_eq!(order_first.text_taxon(&record).as_deref(), Some("Fagales"));
        let genus_first = LineageAssigner::new(&tables).with_priority(RankPriority::GENUS_FIRST);
        assert_eq!(genus_first.text_taxon(&record).as_deref(), Some("Quercus"));
    }

    #[test]
    fn word_listed_under_two_ranks() {
        let tables = ReferenceTables::new(
            ["Quercus", "Rosales"],
            ["Fagaceae"],
            ["Rosales", "Fagales"],
            ["the", "of"],
        );
        let order_first = LineageAssigner::new(&tables);
        let genus_first = LineageAssigner::new(&tables).with_priority(RankPriority::GENUS_FIRST);

        let shared = record("Rosales of the north", "");
        assert_eq!(order_first.text_taxon(&shared).as_deref(), Some("Rosales"));
        assert_eq!(genus_first.text_taxon(&shared).as_deref(), Some("Rosales"));

        let mixed = record("Rosales and Quercus", "");
        assert_eq!(order_first.text_taxon(&mixed).as_deref(), Some("Rosales"));
        assert_eq!(genus_first.text_taxon(&mixed).as_deref(), Some("Quercus"));

        let genus_only = record("Quercus and Fagaceae", "");
        assert_eq!(order_first.text_taxon(&genus_only).as_deref(), Some("Fagaceae"));
    }

    #[test]
    fn priority_rejects_bad_lists() {
        assert_matches!(
            RankPriority::new(&[Rank::Genus, Rank::Genus, Rank::Order]),
            Err(HarvestError::InvalidConfig(_))
        );
        assert_matches!(
            RankPriority::new(&[Rank::Genus]),
            Err(HarvestError::InvalidConfig(_))
        );
        assert_eq!(
            RankPriority::new(&[Rank::Family, Rank::Genus, Rank::Order])
                .unwrap()
                .ranks(),
            &[Rank::Family, Rank::Genus, Rank::Order]
        );
    }

    #[test]
    fn majority_genus_with_first_seen_ties() {
        let tables = tables();
        let assigner = LineageAssigner::new(&tables);
        let labels = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            assigner
                .genus_from_labels(&labels(&["Rosa_canina", "Quercus robur", "Quercus_alba_2"]))
                .as_deref(),
            Some("Quercus")
        );
        assert_eq!(
            assigner
                .genus_from_labels(&labels(&["Fagus_sylvatica", "Betula pendula"]))
                .as_deref(),
            Some("Fagus")
        );
        assert_eq!(assigner.genus_from_labels(&labels(&["taxon1", "taxon2"])), None);
    }

    #[test]
    fn remap_rewrites_prefix_only() {
        let remap = PathRemap::new(vec![
            RemapRule {
                from: "/Users/old/trees".to_string(),
                to: "/data/tree_out".to_string(),
            },
            RemapRule {
                from: "/Users".to_string(),
                to: "/home".to_string(),
            },
        ]);
        assert_eq!(
            remap.apply(Utf8Path::new("/Users/old/trees/10.1_x/a.nwk")),
            Utf8PathBuf::from("/data/tree_out/10.1_x/a.nwk")
        );
        assert_eq!(
            remap.apply(Utf8Path::new("/Users/else/a.nwk")),
            Utf8PathBuf::from("/home/else/a.nwk")
        );
        assert_eq!(
            remap.apply(Utf8Path::new("/srv/Users/a.nwk")),
            Utf8PathBuf::from("/srv/Users/a.nwk")
        );
    }
}
