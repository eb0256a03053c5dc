use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::download::{
    Backoff, DEFAULT_MAX_ATTEMPTS, DEFAULT_SIZE_CAP, DownloadSettings, RetryPolicy,
};
use crate::error::HarvestError;
use crate::extract::{DEFAULT_MAX_DEPTH, DEFAULT_MAX_EXTRACTED_BYTES, ExtractOptions};
use crate::lineage::{PathRemap, RankPriority, RemapRule};
use crate::taxonomy::{Rank, ReferenceSources};

pub const DEFAULT_CONFIG_FILE: &str = "treeharvest.json";
pub const DEFAULT_OUTPUT_DIR: &str = "tree_out";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub reference: ReferenceEntry,
    #[serde(default)]
    pub download: DownloadEntry,
    #[serde(default)]
    pub lineage: LineageEntry,
    #[serde(default)]
    pub path_remap: Vec<RemapRule>,
    #[serde(default)]
    pub extract: ExtractEntry,
    #[serde(default)]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TableFiles {
    Single(String),
    Many(Vec<String>),
}

impl TableFiles {
    fn into_paths(self) -> Vec<PathBuf> {
        match self {
            TableFiles::Single(path) => vec![PathBuf::from(path)],
            TableFiles::Many(paths) => paths.into_iter().map(PathBuf::from).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ReferenceEntry {
    #[serde(default)]
    pub genus: Option<TableFiles>,
    #[serde(default)]
    pub family: Option<TableFiles>,
    #[serde(default)]
    pub order: Option<TableFiles>,
    #[serde(default)]
    pub common_words: Option<TableFiles>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DownloadEntry {
    #[serde(default)]
    pub size_cap_bytes: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<BackoffKind>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub request_delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LineageEntry {
    #[serde(default)]
    pub priority: Option<Vec<Rank>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ExtractEntry {
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub max_extracted_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub output_dir: Utf8PathBuf,
    pub reference: ReferenceSources,
    pub download: DownloadSettings,
    pub priority: RankPriority,
    pub path_remap: PathRemap,
    pub extract: ExtractOptions,
    pub workers: Option<usize>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        match Self::resolve(path) {
            Err(HarvestError::MissingConfig) => Self::resolve_config(Config::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(HarvestError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let output_dir = config
            .output_dir
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_OUTPUT_DIR));
        if output_dir.as_str().is_empty() {
            return Err(HarvestError::InvalidConfig(
                "output_dir must not be empty".to_string(),
            ));
        }

        let reference = resolve_reference(config.reference);
        let download = resolve_download(config.download)?;

        let priority = match config.lineage.priority {
            Some(ranks) => RankPriority::new(&ranks)?,
            None => RankPriority::default(),
        };

        let max_depth = config.extract.max_depth.unwrap_or(DEFAULT_MAX_DEPTH);
        let max_extracted_bytes = config
            .extract
            .max_extracted_bytes
            .unwrap_or(DEFAULT_MAX_EXTRACTED_BYTES);
        if max_extracted_bytes == 0 {
            return Err(HarvestError::InvalidConfig(
                "extract.max_extracted_bytes must be at least 1".to_string(),
            ));
        }

        if config.workers == Some(0) {
            return Err(HarvestError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            output_dir,
            reference,
            download,
            priority,
            path_remap: PathRemap::new(config.path_remap),
            extract: ExtractOptions {
                max_depth,
                max_extracted_bytes,
            },
            workers: config.workers,
        })
    }
}

fn resolve_reference(entry: ReferenceEntry) -> ReferenceSources {
    let files = |value: Option<TableFiles>, defaults: &[&str]| match value {
        Some(value) => value.into_paths(),
        None => defaults.iter().map(PathBuf::from).collect(),
    };
    ReferenceSources {
        genus: files(entry.genus, &["data/genus.csv"]),
        family: files(
            entry.family,
            &["data/other_families.csv", "data/plant_families.csv"],
        ),
        order: files(
            entry.order,
            &["data/animal_orders.csv", "data/other_orders.csv"],
        ),
        common_words: files(entry.common_words, &["data/1000_frequent_words.txt"]),
    }
}

fn resolve_download(entry: DownloadEntry) -> Result<DownloadSettings, HarvestError> {
    let defaults = DownloadSettings::default();

    let max_attempts = entry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
    if max_attempts == 0 {
        return Err(HarvestError::InvalidConfig(
            "download.max_attempts must be at least 1".to_string(),
        ));
    }

    let base = entry
        .backoff_ms
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(500));
    let backoff = match entry.backoff.unwrap_or(BackoffKind::Fixed) {
        BackoffKind::Fixed => Backoff::Fixed(base),
        BackoffKind::Exponential => {
            let max = entry
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(30));
            if max < base {
                return Err(HarvestError::InvalidConfig(
                    "download.max_backoff_ms is below download.backoff_ms".to_string(),
                ));
            }
            Backoff::Exponential { base, max }
        }
    };

    let timeout = entry
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.timeout);
    if timeout.is_zero() {
        return Err(HarvestError::InvalidConfig(
            "download.timeout_secs must be at least 1".to_string(),
        ));
    }

    Ok(DownloadSettings {
        size_cap: entry.size_cap_bytes.unwrap_or(DEFAULT_SIZE_CAP),
        retry: RetryPolicy {
            max_attempts,
            backoff,
        },
        request_delay: entry
            .request_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_delay),
        timeout,
    })
}
