use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::HarvestError;

static DOI_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"10\.\d+/[^\s]+").expect("DOI pattern compiles"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Doi(String);

impl Doi {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn folder_name(&self) -> String {
        sanitize_component(&self.0)
    }
}

impl fmt::Display for Doi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Doi {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let found = DOI_PATTERN
            .find(value.trim())
            .ok_or_else(|| HarvestError::InvalidDoi(value.to_string()))?;
        let doi = found.as_str().trim_end_matches(['.', ',', ';', ')']);
        Ok(Self(doi.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignType {
    #[serde(alias = "not_found")]
    Fail,
    ByText,
    ByTree,
    Both,
    ByTextBad,
}

impl AssignType {
    pub const ALL: [AssignType; 5] = [
        AssignType::Fail,
        AssignType::ByText,
        AssignType::ByTree,
        AssignType::Both,
        AssignType::ByTextBad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssignType::Fail => "fail",
            AssignType::ByText => "by_text",
            AssignType::ByTree => "by_tree",
            AssignType::Both => "both",
            AssignType::ByTextBad => "by_text_bad",
        }
    }
}

impl fmt::Display for AssignType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    pub taxon: String,
    pub assign_type: AssignType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub doi: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub identifier: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub author: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub journal_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub pub_date: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub issue: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub volume: String,
    #[serde(rename = "abstract", default, deserialize_with = "lenient_string")]
    pub abstract_text: String,
    #[serde(default, deserialize_with = "lenient_paths")]
    tree_files: Vec<Utf8PathBuf>,
    #[serde(default, deserialize_with = "lenient_string")]
    lineage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    assign_type: Option<AssignType>,
}

impl PaperRecord {
    pub fn new(doi: impl Into<String>) -> Self {
        Self {
            doi: doi.into(),
            ..Self::default()
        }
    }

    pub fn tree_files(&self) -> &[Utf8PathBuf] {
        &self.tree_files
    }

    /// Replaces the whole tree file list; discovery order is kept.
    pub fn add_trees(&mut self, trees: Vec<Utf8PathBuf>) {
        self.tree_files = trees;
    }

    pub fn has_tree(&self) -> bool {
        !self.tree_files.is_empty()
    }

    pub fn lineage(&self) -> &str {
        &self.lineage
    }

    pub fn assign_type(&self) -> Option<AssignType> {
        self.assign_type
    }

    pub fn apply(&mut self, lineage: Lineage) {
        self.lineage = lineage.taxon;
        self.assign_type = Some(lineage.assign_type);
    }

    pub fn output_dir(&self, root: &Utf8Path) -> Option<Utf8PathBuf> {
        if let Ok(doi) = self.doi.parse::<Doi>() {
            return Some(root.join(doi.folder_name()));
        }
        let identifier = self.identifier.trim();
        if identifier.is_empty() {
            return None;
        }
        Some(root.join(sanitize_component(identifier)))
    }
}

fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseScalar {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<LooseScalar>::deserialize(deserializer)?;
    Ok(match value {
        None => String::new(),
        Some(LooseScalar::Text(text)) => text,
        Some(LooseScalar::Number(number)) => number.to_string(),
        Some(LooseScalar::Flag(flag)) => flag.to_string(),
    })
}

fn lenient_paths<'de, D>(deserializer: D) -> Result<Vec<Utf8PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Utf8PathBuf>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_doi_from_decorated_strings() {
        let doi: Doi = "https://doi.org/10.1111/jbi.13789".parse().unwrap();
        assert_eq!(doi.as_str(), "10.1111/jbi.13789");
        let doi: Doi = "doi:10.5061/dryad.1g1jwstss".parse().unwrap();
        assert_eq!(doi.folder_name(), "10.5061_dryad.1g1jwstss");
    }

    #[test]
    fn parse_doi_invalid() {
        let err = "not a doi".parse::<Doi>().unwrap_err();
        assert_matches!(err, HarvestError::InvalidDoi(_));
    }

    #[test]
    fn record_defaults_and_loose_fields() {
        let json = r#"{"doi": "10.1/x", "issue": 4, "volume": null, "extra": 1,
                       "tree_files": ["a.nwk"], "assign_type": "not_found"}"#;
        let record: PaperRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.issue, "4");
        assert_eq!(record.volume, "");
        assert_eq!(record.title, "");
        assert!(record.has_tree());
        assert_eq!(record.assign_type(), Some(AssignType::Fail));
    }

    #[test]
    fn add_trees_replaces_sequence() {
        let mut record = PaperRecord::new("10.1/x");
        assert!(!record.has_tree());
        record.add_trees(vec!["a.nwk".into(), "b.nwk".into()]);
        record.add_trees(vec!["c.nwk".into()]);
        assert_eq!(record.tree_files(), &[Utf8PathBuf::from("c.nwk")]);
    }

    #[test]
    fn output_dir_prefers_doi() {
        let root = Utf8Path::new("out");
        let record = PaperRecord::new("10.1093/sysbio/49.2.278");
        assert_eq!(
            record.output_dir(root).unwrap(),
            Utf8PathBuf::from("out/10.1093_sysbio_49.2.278")
        );
        let mut record = PaperRecord::new("");
        assert!(record.output_dir(root).is_none());
        record.identifier = "figshare:123".to_string();
        assert_eq!(
            record.output_dir(root).unwrap(),
            Utf8PathBuf::from("out/figshare_123")
        );
    }

    #[test]
    fn serialized_tags_are_snake_case() {
        let mut record = PaperRecord::new("10.1/x");
        record.apply(Lineage {
            taxon: "Rosa".to_string(),
            assign_type: AssignType::ByTextBad,
        });
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["assign_type"], "by_text_bad");
        assert_eq!(value["lineage"], "Rosa");
        assert_eq!(value["abstract"], "");
    }
}
