use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::HarvestError;
use crate::tree_format::{self, TreeFormatError, TreeSchema};

pub fn is_valid_tree(content: &str) -> bool {
    check_tree(content).is_ok()
}

pub fn is_valid_tree_file(path: &Path) -> bool {
    check_tree_file(path).is_ok()
}

// Both readers are tried regardless of the `#NEXUS` hint; the hint only
// picks which failure is reported.
pub fn check_tree(content: &str) -> Result<TreeSchema, TreeFormatError> {
    let newick_err = match tree_format::parse(content, TreeSchema::Newick) {
        Ok(_) => return Ok(TreeSchema::Newick),
        Err(err) => err,
    };
    let nexus_err = match tree_format::parse(content, TreeSchema::Nexus) {
        Ok(_) => return Ok(TreeSchema::Nexus),
        Err(err) => err,
    };
    debug!(%newick_err, %nexus_err, "content is not a tree");
    match TreeSchema::sniff(content) {
        TreeSchema::Nexus => Err(nexus_err),
        TreeSchema::Newick => Err(newick_err),
    }
}

pub fn check_tree_file(path: &Path) -> Result<TreeSchema, HarvestError> {
    let bytes = fs::read(path).map_err(|err| {
        debug!(path = %path.display(), %err, "cannot read candidate tree file");
        HarvestError::Filesystem(format!("read {}: {err}", path.display()))
    })?;
    Ok(check_tree(&String::from_utf8_lossy(&bytes))?)
}
