use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::tree_format::TreeFormatError;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("missing config file treeharvest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("input file not found: {0}")]
    MissingInput(PathBuf),

    #[error("failed to read reference table at {0}")]
    ReferenceRead(PathBuf),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("download of {url} failed after {attempts} attempts")]
    DownloadFailed { url: String, attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("not a readable zip archive: {0}")]
    BadArchive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to parse records: {0}")]
    RecordParse(String),

    #[error("invalid DOI: {0}")]
    InvalidDoi(String),

    #[error("invalid tree: {0}")]
    Tree(#[from] TreeFormatError),
}
